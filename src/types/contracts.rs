use alloy::sol;

sol! {
    #[sol(rpc)]
    #[derive(Debug)]
    interface IERC20 {
        event Transfer(address indexed from, address indexed to, uint256 amount);

        function approve(address spender, uint256 amount) external returns (bool);
        function transfer(address to, uint256 amount) external returns (bool);
        function balanceOf(address eoa) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
    }
}

sol! {
    /// Router used for batched maker payouts.
    #[sol(rpc)]
    #[derive(Debug)]
    interface IOrbiterRouterV3 {
        function transfers(address[] calldata tos, uint256[] calldata values) external payable;
        function transferTokens(address token, address[] calldata tos, uint256[] calldata values) external;
    }
}
