// src/rpc.rs
use std::sync::Arc;

use ethers::types::U256;
use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::types::ErrorObjectOwned;
use tracing::{debug, error, info};

use crate::error::PaymasterError;
use crate::paymaster::Paymaster;
use crate::types::{
    PostOpMode, PriceState, SettlementContext, SettlementRecord, SponsorInfo, UserOperation,
    ValidationResponse,
};

// The dispatcher-facing interface: two-phase validate/settle plus the
// permissionless price refresh and sponsor metadata.
#[rpc(server, namespace = "pm")]
pub trait PaymasterRpc {
    /// Validates a sponsored operation against its off-chain authorization.
    /// Policy failure comes back inside `validationData`, not as an error.
    #[method(name = "validatePaymasterUserOp")]
    async fn validate(
        &self,
        user_op: UserOperation,
        max_cost: U256,
    ) -> RpcResult<ValidationResponse>;

    /// Settles a previously validated operation.
    #[method(name = "postOp")]
    async fn post_op(
        &self,
        mode: PostOpMode,
        settlement_context: SettlementContext,
        actual_gas_cost: U256,
    ) -> RpcResult<SettlementRecord>;

    /// Forces a price-cache refresh outside the validate path.
    #[method(name = "refreshPrice")]
    async fn refresh_price(&self) -> RpcResult<PriceState>;

    /// Sponsor metadata plus the current cached price.
    #[method(name = "sponsorInfo")]
    async fn sponsor_info(&self) -> RpcResult<SponsorInfo>;
}

pub struct PaymasterRpcImpl {
    paymaster: Arc<Paymaster>,
}

impl PaymasterRpcImpl {
    pub fn new(paymaster: Arc<Paymaster>) -> Self {
        Self { paymaster }
    }
}

fn rpc_error(e: PaymasterError) -> ErrorObjectOwned {
    jsonrpsee::types::error::ErrorObject::owned(-32000, format!("Paymaster error: {e}"), None::<()>)
}

#[async_trait]
impl PaymasterRpcServer for PaymasterRpcImpl {
    async fn validate(
        &self,
        user_op: UserOperation,
        max_cost: U256,
    ) -> RpcResult<ValidationResponse> {
        debug!("Received validation request for sender: {}", user_op.sender);

        match self
            .paymaster
            .validate_paymaster_user_op(&user_op, max_cost)
            .await
        {
            Ok(response) => {
                info!("Validated operation for {}", user_op.sender);
                Ok(response)
            }
            Err(e) => {
                error!("Failed to validate operation: {}", e);
                Err(rpc_error(e))
            }
        }
    }

    async fn post_op(
        &self,
        mode: PostOpMode,
        settlement_context: SettlementContext,
        actual_gas_cost: U256,
    ) -> RpcResult<SettlementRecord> {
        debug!(
            "Received settlement for sender: {}",
            settlement_context.sender
        );

        self.paymaster
            .post_op(mode, settlement_context, actual_gas_cost)
            .await
            .map_err(|e| {
                error!("Failed to settle operation: {}", e);
                rpc_error(e)
            })
    }

    async fn refresh_price(&self) -> RpcResult<PriceState> {
        self.paymaster.refresh_price().await.map_err(rpc_error)
    }

    async fn sponsor_info(&self) -> RpcResult<SponsorInfo> {
        let mut info = self.paymaster.sponsor_info();
        info.cached_price = self.paymaster.cached_price().await;
        Ok(info)
    }
}
