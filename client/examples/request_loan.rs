//! Example: Request a loan and follow it through approval and disbursement
//!
//! Reads `sahakari.toml` (see `sahakari.example.toml`) overlaid with
//! `SAHAKARI__*` environment variables. The configured account must be
//! unlocked on the node, and must hold the admin role for the approval step.

use anyhow::Context;
use sahakari_client::{init_tracing, ClientConfig, SahakariClient, Usdc};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    println!("=== DeFi Sahakari Loan Example ===\n");

    let path = std::env::var("SAHAKARI_CONFIG").unwrap_or_else(|_| "sahakari".to_string());
    let config = ClientConfig::load(&path).context("loading configuration")?;
    println!("Network: {:?} (chain {})", config.network, config.chain_id);
    println!("RPC URL: {}", config.rpc_url);
    println!("Account: {:?}\n", config.account);

    let client = SahakariClient::new(config)?;
    client.health_check().await.context("node health check")?;
    println!("✓ Node reachable\n");

    let amount = Usdc::parse(&std::env::args().nth(1).unwrap_or_else(|| "1000".to_string()))?;
    let orchestrator = client.orchestrator();
    let account = client.config().account;

    let quote = orchestrator.quote_collateral(amount).await?;
    let remote = orchestrator.remote_collateral(amount).await?;
    println!("Quote for {}:", amount.display_with_unit());
    println!("  - ETH price: {}", quote.price.display_with_unit());
    println!("  - Collateral ({}%): {}", quote.ratio_percent, quote.collateral.display_with_unit());
    println!("  - Loan manager's figure: {}\n", remote.display_with_unit());

    let request = orchestrator.request_loan(amount).await?;
    println!("✓ Loan requested in {}", request.receipt.hash);

    let index = orchestrator
        .loans(account)
        .await?
        .last()
        .map(|loan| loan.loan_index)
        .context("requested loan not visible")?;

    match orchestrator.approve_loan(account, index).await {
        Ok(receipt) => println!("✓ Loan {} approved in {}", index, receipt.hash),
        Err(e) => {
            eprintln!("✗ {}", e.user_message());
            return Ok(());
        }
    }

    match orchestrator.disburse_loan(account, index).await {
        Ok(receipt) => println!("✓ Loan {} disbursed in {}", index, receipt.hash),
        Err(e) => eprintln!("✗ {}", e.user_message()),
    }

    println!("\nLoans of {:?}:", account);
    for view in orchestrator.loan_views(account).await? {
        println!(
            "  #{} {} USDC, {} ETH collateral, repay {} by {} [{}]",
            view.loan_index,
            view.principal_usdc,
            view.collateral_eth,
            view.repayment_usdc,
            view.due_date,
            view.state
        );
    }

    Ok(())
}
