//! The remote ledger: the deployed contracts seen through one trait.
//!
//! [`LedgerService`] is the seam between the orchestration layer and the
//! chain. [`RpcLedger`] implements it over JSON-RPC; tests substitute an
//! in-memory ledger. Writes are expressed as [`LedgerCall`] values and go
//! through the two-phase `submit`/`confirm` pair.

use crate::amount::{Usdc, Wei};
use crate::codec::{self, encode_call};
use crate::config::ContractAddresses;
use crate::error::Result;
use crate::rpc::CallRequest;
use crate::transaction::TransactionManager;
use crate::types::{Loan, Member, PendingTransaction, TxReceipt};
use async_trait::async_trait;
use ethers::abi::Token;
use ethers::types::{Address, I256, U256};
use tracing::debug;

/// A state-changing contract call
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerCall {
    /// `MemberRegistry.registerMember(string)`
    RegisterMember { name: String },
    /// `FundingPool.depositUSDC(uint256)`
    DepositUsdc { amount: Usdc },
    /// `FundingPool.withdrawUSDC(uint256)`
    WithdrawUsdc { amount: Usdc },
    /// `FundingPool.withdrawETH(uint256)`
    WithdrawEth { amount: Wei },
    /// `ERC20.approve(address,uint256)` on `token`
    ApproveToken {
        token: Address,
        spender: Address,
        amount: U256,
    },
    /// `FundingPool.approveLoanManager(uint256)`
    ApproveLoanManager { amount: U256 },
    /// `LoanManager.requestLoan(uint256,uint256)` with the collateral attached
    RequestLoan { amount: Usdc, collateral: Wei },
    /// `LoanManager.approveLoan(address,uint256)`
    ApproveLoan { borrower: Address, index: u64 },
    /// `LoanManager.disburseLoan(address,uint256)`
    DisburseLoan { borrower: Address, index: u64 },
    /// `LoanManager.repayLoan(address,uint256,uint256)`
    RepayLoan {
        borrower: Address,
        index: u64,
        amount: Usdc,
    },
    /// `LoanManager.returnCollateral(address,uint256)`
    ReturnCollateral { borrower: Address, index: u64 },
    /// `FinanceProcessor.accrueInterest(address)`
    AccrueInterest { member: Address },
    /// `FinanceProcessor.distributeInterest()`
    DistributeInterest,
    /// `FinanceProcessor.processLoanApproval(address,uint256)`
    ProcessLoanApproval { borrower: Address, index: u64 },
    /// `FinanceProcessor.processLoanRepayment(address,uint256,uint256)`
    ProcessLoanRepayment {
        borrower: Address,
        index: u64,
        amount: Usdc,
    },
    /// `FinanceProcessor.liquidateCollateral(address,uint256)`
    LiquidateCollateral { borrower: Address, index: u64 },
}

impl LedgerCall {
    /// Contract function name
    pub fn function_name(&self) -> &'static str {
        match self {
            LedgerCall::RegisterMember { .. } => "registerMember",
            LedgerCall::DepositUsdc { .. } => "depositUSDC",
            LedgerCall::WithdrawUsdc { .. } => "withdrawUSDC",
            LedgerCall::WithdrawEth { .. } => "withdrawETH",
            LedgerCall::ApproveToken { .. } => "approve",
            LedgerCall::ApproveLoanManager { .. } => "approveLoanManager",
            LedgerCall::RequestLoan { .. } => "requestLoan",
            LedgerCall::ApproveLoan { .. } => "approveLoan",
            LedgerCall::DisburseLoan { .. } => "disburseLoan",
            LedgerCall::RepayLoan { .. } => "repayLoan",
            LedgerCall::ReturnCollateral { .. } => "returnCollateral",
            LedgerCall::AccrueInterest { .. } => "accrueInterest",
            LedgerCall::DistributeInterest => "distributeInterest",
            LedgerCall::ProcessLoanApproval { .. } => "processLoanApproval",
            LedgerCall::ProcessLoanRepayment { .. } => "processLoanRepayment",
            LedgerCall::LiquidateCollateral { .. } => "liquidateCollateral",
        }
    }

    /// Target contract, calldata and attached value
    pub fn to_request(&self, contracts: &ContractAddresses) -> CallRequest {
        let loan_ref = |borrower: &Address, index: &u64| {
            vec![Token::Address(*borrower), Token::Uint(U256::from(*index))]
        };

        let (to, signature, args, value) = match self {
            LedgerCall::RegisterMember { name } => (
                contracts.member_registry,
                "registerMember(string)",
                vec![Token::String(name.clone())],
                U256::zero(),
            ),
            LedgerCall::DepositUsdc { amount } => (
                contracts.funding_pool,
                "depositUSDC(uint256)",
                vec![Token::Uint(amount.raw())],
                U256::zero(),
            ),
            LedgerCall::WithdrawUsdc { amount } => (
                contracts.funding_pool,
                "withdrawUSDC(uint256)",
                vec![Token::Uint(amount.raw())],
                U256::zero(),
            ),
            LedgerCall::WithdrawEth { amount } => (
                contracts.funding_pool,
                "withdrawETH(uint256)",
                vec![Token::Uint(amount.raw())],
                U256::zero(),
            ),
            LedgerCall::ApproveToken {
                token,
                spender,
                amount,
            } => (
                *token,
                "approve(address,uint256)",
                vec![Token::Address(*spender), Token::Uint(*amount)],
                U256::zero(),
            ),
            LedgerCall::ApproveLoanManager { amount } => (
                contracts.funding_pool,
                "approveLoanManager(uint256)",
                vec![Token::Uint(*amount)],
                U256::zero(),
            ),
            LedgerCall::RequestLoan { amount, collateral } => (
                contracts.loan_manager,
                "requestLoan(uint256,uint256)",
                vec![Token::Uint(amount.raw()), Token::Uint(collateral.raw())],
                collateral.raw(),
            ),
            LedgerCall::ApproveLoan { borrower, index } => (
                contracts.loan_manager,
                "approveLoan(address,uint256)",
                loan_ref(borrower, index),
                U256::zero(),
            ),
            LedgerCall::DisburseLoan { borrower, index } => (
                contracts.loan_manager,
                "disburseLoan(address,uint256)",
                loan_ref(borrower, index),
                U256::zero(),
            ),
            LedgerCall::RepayLoan {
                borrower,
                index,
                amount,
            } => {
                let mut args = loan_ref(borrower, index);
                args.push(Token::Uint(amount.raw()));
                (
                    contracts.loan_manager,
                    "repayLoan(address,uint256,uint256)",
                    args,
                    U256::zero(),
                )
            }
            LedgerCall::ReturnCollateral { borrower, index } => (
                contracts.loan_manager,
                "returnCollateral(address,uint256)",
                loan_ref(borrower, index),
                U256::zero(),
            ),
            LedgerCall::AccrueInterest { member } => (
                contracts.finance_processor,
                "accrueInterest(address)",
                vec![Token::Address(*member)],
                U256::zero(),
            ),
            LedgerCall::DistributeInterest => (
                contracts.finance_processor,
                "distributeInterest()",
                vec![],
                U256::zero(),
            ),
            LedgerCall::ProcessLoanApproval { borrower, index } => (
                contracts.finance_processor,
                "processLoanApproval(address,uint256)",
                loan_ref(borrower, index),
                U256::zero(),
            ),
            LedgerCall::ProcessLoanRepayment {
                borrower,
                index,
                amount,
            } => {
                let mut args = loan_ref(borrower, index);
                args.push(Token::Uint(amount.raw()));
                (
                    contracts.finance_processor,
                    "processLoanRepayment(address,uint256,uint256)",
                    args,
                    U256::zero(),
                )
            }
            LedgerCall::LiquidateCollateral { borrower, index } => (
                contracts.finance_processor,
                "liquidateCollateral(address,uint256)",
                loan_ref(borrower, index),
                U256::zero(),
            ),
        };

        CallRequest {
            to,
            data: encode_call(signature, &args),
            value,
        }
    }
}

/// Read and write access to the deployed contracts
#[async_trait]
pub trait LedgerService: Send + Sync {
    /// Account transactions are sent from
    fn account(&self) -> Address;

    /// Deployed contract addresses
    fn contracts(&self) -> &ContractAddresses;

    /// `MemberRegistry.getMember`
    async fn get_member(&self, address: Address) -> Result<Member>;

    /// `MemberRegistry.getAllMembers`
    async fn get_all_members(&self) -> Result<Vec<Address>>;

    /// `LoanManager.getLoans`, in insertion order
    async fn get_loans(&self, borrower: Address) -> Result<Vec<Loan>>;

    /// ERC-20 allowance of `spender` over `owner`'s `token`
    async fn allowance(&self, token: Address, owner: Address, spender: Address) -> Result<U256>;

    /// ERC-20 balance
    async fn token_balance(&self, token: Address, owner: Address) -> Result<U256>;

    /// USDC a member holds in the funding pool
    async fn pool_usdc_balance(&self, member: Address) -> Result<Usdc>;

    /// ETH a member holds in the funding pool
    async fn pool_eth_balance(&self, member: Address) -> Result<Wei>;

    /// Pool-wide USDC deposits
    async fn total_usdc_deposits(&self) -> Result<Usdc>;

    /// Pool-wide ETH deposits
    async fn total_eth_deposits(&self) -> Result<Wei>;

    /// Interest accrued to a member
    async fn usdc_interest_accrued(&self, member: Address) -> Result<Usdc>;

    /// Raw answer of the price feed, 8 decimals, may be non-positive
    async fn latest_price(&self) -> Result<I256>;

    /// The loan manager's own collateral figure
    async fn calculate_eth_collateral(&self, amount: Usdc) -> Result<Wei>;

    /// Hand a call to the signer; returns once accepted
    async fn submit(&self, call: LedgerCall) -> Result<PendingTransaction>;

    /// Wait for a submitted call to be mined successfully
    async fn confirm(&self, pending: &PendingTransaction) -> Result<TxReceipt>;
}

/// [`LedgerService`] over Ethereum JSON-RPC
#[derive(Clone)]
pub struct RpcLedger {
    /// Transaction manager
    tx: TransactionManager,
    /// Contract addresses
    contracts: ContractAddresses,
}

impl RpcLedger {
    /// Create a ledger bound to the given contracts
    pub fn new(tx: TransactionManager, contracts: ContractAddresses) -> Self {
        Self { tx, contracts }
    }

    /// Get the transaction manager
    pub fn transactions(&self) -> &TransactionManager {
        &self.tx
    }

    async fn read(&self, to: Address, signature: &str, args: &[Token]) -> Result<Vec<u8>> {
        debug!("eth_call {} on {:?}", signature, to);
        let request = CallRequest {
            to,
            data: encode_call(signature, args),
            value: U256::zero(),
        };
        Ok(self.tx.call(&request).await?.to_vec())
    }

    async fn read_uint(&self, to: Address, signature: &str, args: &[Token]) -> Result<U256> {
        let data = self.read(to, signature, args).await?;
        codec::decode_uint(&data)
    }
}

#[async_trait]
impl LedgerService for RpcLedger {
    fn account(&self) -> Address {
        self.tx.account()
    }

    fn contracts(&self) -> &ContractAddresses {
        &self.contracts
    }

    async fn get_member(&self, address: Address) -> Result<Member> {
        let data = self
            .read(
                self.contracts.member_registry,
                "getMember(address)",
                &[Token::Address(address)],
            )
            .await?;
        codec::decode_member(&data)
    }

    async fn get_all_members(&self) -> Result<Vec<Address>> {
        let data = self
            .read(self.contracts.member_registry, "getAllMembers()", &[])
            .await?;
        codec::decode_address_array(&data)
    }

    async fn get_loans(&self, borrower: Address) -> Result<Vec<Loan>> {
        let data = self
            .read(
                self.contracts.loan_manager,
                "getLoans(address)",
                &[Token::Address(borrower)],
            )
            .await?;
        codec::decode_loans(&data)
    }

    async fn allowance(&self, token: Address, owner: Address, spender: Address) -> Result<U256> {
        self.read_uint(
            token,
            "allowance(address,address)",
            &[Token::Address(owner), Token::Address(spender)],
        )
        .await
    }

    async fn token_balance(&self, token: Address, owner: Address) -> Result<U256> {
        self.read_uint(token, "balanceOf(address)", &[Token::Address(owner)])
            .await
    }

    async fn pool_usdc_balance(&self, member: Address) -> Result<Usdc> {
        self.read_uint(
            self.contracts.funding_pool,
            "getUSDCBalance(address)",
            &[Token::Address(member)],
        )
        .await
        .map(Usdc::from_raw)
    }

    async fn pool_eth_balance(&self, member: Address) -> Result<Wei> {
        self.read_uint(
            self.contracts.funding_pool,
            "getEthBalance(address)",
            &[Token::Address(member)],
        )
        .await
        .map(Wei::from_raw)
    }

    async fn total_usdc_deposits(&self) -> Result<Usdc> {
        self.read_uint(self.contracts.funding_pool, "totalUsdcDeposits()", &[])
            .await
            .map(Usdc::from_raw)
    }

    async fn total_eth_deposits(&self) -> Result<Wei> {
        self.read_uint(self.contracts.funding_pool, "totalEthDeposits()", &[])
            .await
            .map(Wei::from_raw)
    }

    async fn usdc_interest_accrued(&self, member: Address) -> Result<Usdc> {
        self.read_uint(
            self.contracts.finance_processor,
            "getUSDCInterestAccrued(address)",
            &[Token::Address(member)],
        )
        .await
        .map(Usdc::from_raw)
    }

    async fn latest_price(&self) -> Result<I256> {
        let data = self
            .read(self.contracts.price_feed, "getLatestPrice()", &[])
            .await?;
        codec::decode_int(&data)
    }

    async fn calculate_eth_collateral(&self, amount: Usdc) -> Result<Wei> {
        self.read_uint(
            self.contracts.loan_manager,
            "calculateEthCollateral(uint256)",
            &[Token::Uint(amount.raw())],
        )
        .await
        .map(Wei::from_raw)
    }

    async fn submit(&self, call: LedgerCall) -> Result<PendingTransaction> {
        let request = call.to_request(&self.contracts);
        self.tx.submit(&request, call.function_name()).await
    }

    async fn confirm(&self, pending: &PendingTransaction) -> Result<TxReceipt> {
        self.tx.confirm(pending).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_contracts;

    #[test]
    fn test_request_loan_attaches_collateral() {
        let contracts = test_contracts();
        let call = LedgerCall::RequestLoan {
            amount: Usdc::from(1_000_000_000),
            collateral: Wei::from(750_000_000_000_000_000),
        };
        let request = call.to_request(&contracts);

        assert_eq!(request.to, contracts.loan_manager);
        assert_eq!(request.value, U256::from(750_000_000_000_000_000u64));
        assert_eq!(request.data.len(), 4 + 2 * 32);
        assert_eq!(call.function_name(), "requestLoan");
    }

    #[test]
    fn test_calls_route_to_owning_contract() {
        let contracts = test_contracts();
        let borrower = Address::repeat_byte(0x42);

        let cases = [
            (
                LedgerCall::RegisterMember {
                    name: "Asha".to_string(),
                },
                contracts.member_registry,
            ),
            (
                LedgerCall::ApproveLoanManager {
                    amount: U256::from(5u64),
                },
                contracts.funding_pool,
            ),
            (
                LedgerCall::ReturnCollateral { borrower, index: 0 },
                contracts.loan_manager,
            ),
            (
                LedgerCall::LiquidateCollateral { borrower, index: 0 },
                contracts.finance_processor,
            ),
            (
                LedgerCall::ApproveToken {
                    token: contracts.usdc_token,
                    spender: contracts.funding_pool,
                    amount: U256::one(),
                },
                contracts.usdc_token,
            ),
        ];

        for (call, target) in cases {
            let request = call.to_request(&contracts);
            assert_eq!(request.to, target, "{}", call.function_name());
            assert!(request.value.is_zero());
        }
    }

    #[test]
    fn test_distribute_interest_has_no_arguments() {
        let request = LedgerCall::DistributeInterest.to_request(&test_contracts());
        assert_eq!(request.data.len(), 4);
    }
}
