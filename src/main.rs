// src/main.rs
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use dotenv::dotenv;
use ethers::types::Address;
use jsonrpsee::server::ServerBuilder;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use erc20_paymaster::chain::{self, ChainPriceFeed, ChainStakeLedger, ChainTokenLedger};
use erc20_paymaster::fees::FeeEngine;
use erc20_paymaster::paymaster::{Paymaster, PaymasterConfig};
use erc20_paymaster::rpc::{PaymasterRpcImpl, PaymasterRpcServer};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(long, default_value = "127.0.0.1:8545")]
    rpc_server_addr: String,

    #[clap(long)]
    eth_rpc_url: String,

    #[clap(long)]
    chain_id: u64,

    /// Key that submits settlement transfers; not the trusted signer.
    #[clap(long)]
    private_key: String,

    /// Paymaster identity the authorization blobs are addressed to.
    #[clap(long)]
    paymaster_address: Address,

    #[clap(long)]
    entry_point: Address,

    #[clap(long)]
    trusted_signer: Address,

    #[clap(long)]
    owner: Address,

    #[clap(long, default_value_t = 120)]
    max_price_age_secs: u64,

    /// ERC-20 fee token; enables the metered variant together with the two
    /// oracle addresses.
    #[clap(long)]
    token: Option<Address>,

    #[clap(long, default_value_t = 6)]
    token_decimals: u8,

    #[clap(long)]
    token_price_oracle: Option<Address>,

    #[clap(long)]
    native_price_oracle: Option<Address>,

    #[clap(long, default_value_t = 110)]
    price_markup: u32,

    #[clap(long, default_value_t = 25_000)]
    price_update_threshold: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();

    let client = chain::connect(&args.eth_rpc_url, &args.private_key, args.chain_id)?;
    let stake = Arc::new(ChainStakeLedger::new(args.entry_point, client.clone()));

    let config = PaymasterConfig {
        address: args.paymaster_address,
        chain_id: args.chain_id,
        trusted_signer: args.trusted_signer,
        owner: args.owner,
        max_price_age: Duration::from_secs(args.max_price_age_secs),
    };

    let paymaster = match args.token {
        Some(token) => {
            let token_oracle = args
                .token_price_oracle
                .context("--token-price-oracle is required with --token")?;
            let native_oracle = args
                .native_price_oracle
                .context("--native-price-oracle is required with --token")?;
            let fee = FeeEngine::new(
                token,
                args.token_decimals,
                args.price_markup,
                args.price_update_threshold,
                Arc::new(ChainPriceFeed::new(token_oracle, client.clone())),
                Arc::new(ChainPriceFeed::new(native_oracle, client.clone())),
            )?;
            let ledger = Arc::new(ChainTokenLedger::new(token, client.clone()));
            Paymaster::new_metered(config, fee, ledger, stake)
        }
        None => Paymaster::new_verifying(config, stake),
    };

    let server_addr: SocketAddr = args.rpc_server_addr.parse()?;
    info!("Starting paymaster RPC server on {}", server_addr);

    let server = ServerBuilder::default().build(server_addr).await?;
    let handle = server.start(PaymasterRpcImpl::new(Arc::new(paymaster)).into_rpc());

    tokio::signal::ctrl_c().await?;
    handle.stop()?;
    info!("Server stopped");

    Ok(())
}
