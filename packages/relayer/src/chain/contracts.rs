//! Bridge contract ABI definitions
//!
//! Uses alloy's sol! macro to generate type-safe bindings for both ends of the bridge.

use alloy::sol;

sol! {
    /// Vault on the source chain: holds locked funds, releases them on burn
    #[sol(rpc)]
    contract SourceVault {
        /// Release previously locked funds (relayer only)
        function release(address user, uint256 amount) external;

        /// Currently authorized relayer
        function relayer() external view returns (address);

        /// Rotate the relayer identity (owner only)
        function setRelayer(address newRelayer) external;

        event Locked(address indexed user, uint256 amount, address destination);
    }
}

sol! {
    /// Bridge on the destination chain: mints and burns the wrapped token
    #[sol(rpc)]
    contract DestinationBridge {
        /// Mint wrapped tokens for a lock observed on the source chain (relayer only)
        function mint(address user, uint256 amount) external;

        function relayer() external view returns (address);

        function setRelayer(address newRelayer) external;

        event Burned(address indexed user, uint256 amount, address destination);
    }
}
