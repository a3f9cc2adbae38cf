//! Contract Bindings
//!
//! Manager, registry, SSV network/views, ERC-20 and swap quoter interfaces.

use alloy::sol;
use oracle_core::ClusterSnapshot;

sol! {
    /// SSV cluster accounting record
    #[derive(Debug, PartialEq, Eq)]
    struct Cluster {
        uint32 validatorCount;
        uint64 networkFeeIndex;
        uint64 index;
        bool active;
        uint256 balance;
    }

    #[sol(rpc)]
    interface IManager {
        struct PoolDetails {
            uint32 id;
            uint256 balance;
            bytes publicKey;
            uint64[] operatorIds;
            uint256 reshares;
            uint8 status;
        }

        event DepositRequested(uint32 indexed poolId);
        event CompletedExitReportsRequested(uint256 count);
        event ForcedExitReportsRequested(uint256 count);

        function getPendingPoolIds() external view returns (uint32[] memory);
        function getStakedPoolIds() external view returns (uint32[] memory);
        function getPoolDetails(uint32 poolId) external view returns (PoolDetails memory);
        function getFunctionsBalance() external view returns (uint256);
        function getRequestedCompletedExits() external view returns (uint256);
        function getUpkeepBalance() external view returns (uint256);

        function initiatePool(
            uint32 poolId,
            bytes32 depositDataRoot,
            bytes calldata publicKey,
            bytes calldata signature,
            bytes32 withdrawalCredentials,
            uint64[] calldata operatorIds,
            bytes calldata shares,
            Cluster calldata cluster,
            uint256 feeAmount,
            uint256 minTokenAmount,
            bool processed
        ) external;

        function activatePool(uint32 poolId) external;

        function resharePool(
            uint32 poolId,
            uint64[] calldata operatorIds,
            uint64 newOperatorId,
            uint64 oldOperatorId,
            bytes calldata shares,
            Cluster calldata cluster,
            Cluster calldata oldCluster,
            uint256 feeAmount,
            uint256 minTokenAmount,
            bool processed
        ) external;

        function requestPoolExit(uint32 poolId) external;

        function reportCompletedExit(
            uint32 poolId,
            uint32[4] calldata blamePercents,
            Cluster calldata cluster
        ) external;

        function reportForcedExits(uint32[] calldata poolIds) external;

        function depositFunctionsBalance(uint256 feeAmount, uint256 minTokenAmount, bool processed) external;
        function depositUpkeepBalance(uint256 feeAmount, uint256 minTokenAmount, bool processed) external;
        function depositClusterBalance(
            uint64[] calldata operatorIds,
            Cluster calldata cluster,
            uint256 feeAmount,
            uint256 minTokenAmount,
            bool processed
        ) external;
    }

    #[sol(rpc)]
    interface IRegistry {
        struct Operator {
            uint64 id;
            bool active;
            bool resharing;
            uint256 collateral;
            uint256 poolCount;
        }

        event OperatorDeactivationRequested(uint64 indexed operatorId);

        function getOperatorIds() external view returns (uint64[] memory);
        function getOperator(uint64 operatorId) external view returns (Operator memory);
    }

    #[sol(rpc)]
    interface ISSVViews {
        function getOperatorFee(uint64 operatorId) external view returns (uint256);
        function getNetworkFee() external view returns (uint256);
        function getLiquidationThresholdPeriod() external view returns (uint64);
        function getBalance(address owner, uint64[] calldata operatorIds, Cluster calldata cluster) external view returns (uint256);
    }

    #[sol(rpc)]
    interface ISSVNetwork {
        event ValidatorAdded(address indexed owner, uint64[] operatorIds, bytes publicKey, bytes shares, Cluster cluster);
        event ValidatorRemoved(address indexed owner, uint64[] operatorIds, bytes publicKey, Cluster cluster);
        event ClusterLiquidated(address indexed owner, uint64[] operatorIds, Cluster cluster);
        event ClusterReactivated(address indexed owner, uint64[] operatorIds, Cluster cluster);
        event ClusterWithdrawn(address indexed owner, uint64[] operatorIds, uint256 value, Cluster cluster);
        event ClusterDeposited(address indexed owner, uint64[] operatorIds, uint256 value, Cluster cluster);
    }

    #[sol(rpc)]
    interface IERC20 {
        function balanceOf(address account) external view returns (uint256);
        function transfer(address to, uint256 amount) external returns (bool);
    }

    #[sol(rpc)]
    interface IQuoterV2 {
        struct QuoteExactOutputSingleParams {
            address tokenIn;
            address tokenOut;
            uint256 amount;
            uint24 fee;
            uint160 sqrtPriceLimitX96;
        }

        function quoteExactOutputSingle(QuoteExactOutputSingleParams memory params)
            external
            returns (uint256 amountIn, uint160 sqrtPriceX96After, uint32 initializedTicksCrossed, uint256 gasEstimate);
    }
}

impl From<Cluster> for ClusterSnapshot {
    fn from(c: Cluster) -> Self {
        Self {
            validator_count: c.validatorCount,
            network_fee_index: c.networkFeeIndex,
            index: c.index,
            active: c.active,
            balance: c.balance,
        }
    }
}

impl From<ClusterSnapshot> for Cluster {
    fn from(c: ClusterSnapshot) -> Self {
        Self {
            validatorCount: c.validator_count,
            networkFeeIndex: c.network_fee_index,
            index: c.index,
            active: c.active,
            balance: c.balance,
        }
    }
}
