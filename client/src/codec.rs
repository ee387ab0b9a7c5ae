//! ABI encoding of contract calls and decoding of their results.
//!
//! This is the only place that knows the contracts' function signatures and
//! return layouts. `decode_loans` is the single mapping from the loan manager's
//! tuple layout to [`Loan`].

use crate::amount::{Usdc, Wei};
use crate::error::{Result, SahakariError};
use crate::types::{Loan, Member};
use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, I256, U256};
use ethers::utils::id;

/// Calldata for `signature` with `args`
pub fn encode_call(signature: &str, args: &[Token]) -> Bytes {
    let mut data = id(signature).to_vec();
    data.extend(abi::encode(args));
    Bytes::from(data)
}

fn decode(types: &[ParamType], data: &[u8], what: &str) -> Result<Vec<Token>> {
    abi::decode(types, data)
        .map_err(|e| SahakariError::Abi(format!("Failed to decode {}: {}", what, e)))
}

fn expect_uint(token: Token, what: &str) -> Result<U256> {
    token
        .into_uint()
        .ok_or_else(|| SahakariError::Abi(format!("{} is not a uint", what)))
}

fn expect_bool(token: Token, what: &str) -> Result<bool> {
    token
        .into_bool()
        .ok_or_else(|| SahakariError::Abi(format!("{} is not a bool", what)))
}

fn expect_address(token: Token, what: &str) -> Result<Address> {
    token
        .into_address()
        .ok_or_else(|| SahakariError::Abi(format!("{} is not an address", what)))
}

fn u256_to_u64(value: U256, what: &str) -> Result<u64> {
    if value > U256::from(u64::MAX) {
        return Err(SahakariError::Abi(format!("{} exceeds 64 bits", what)));
    }
    Ok(value.as_u64())
}

/// Decode a single `uint256` return value
pub fn decode_uint(data: &[u8]) -> Result<U256> {
    let mut tokens = decode(&[ParamType::Uint(256)], data, "uint256")?;
    expect_uint(tokens.remove(0), "return value")
}

/// Decode a single `int256` return value
pub fn decode_int(data: &[u8]) -> Result<I256> {
    let mut tokens = decode(&[ParamType::Int(256)], data, "int256")?;
    tokens
        .remove(0)
        .into_int()
        .map(I256::from_raw)
        .ok_or_else(|| SahakariError::Abi("return value is not an int".to_string()))
}

/// Decode an `address[]` return value
pub fn decode_address_array(data: &[u8]) -> Result<Vec<Address>> {
    let mut tokens = decode(
        &[ParamType::Array(Box::new(ParamType::Address))],
        data,
        "address[]",
    )?;
    tokens
        .remove(0)
        .into_array()
        .ok_or_else(|| SahakariError::Abi("return value is not an array".to_string()))?
        .into_iter()
        .map(|t| expect_address(t, "member"))
        .collect()
}

fn loan_tuple() -> ParamType {
    ParamType::Tuple(vec![
        ParamType::Address,   // borrower
        ParamType::Uint(256), // amount
        ParamType::Uint(256), // ethCollateral
        ParamType::Uint(256), // repaymentAmount
        ParamType::Uint(256), // dueDate
        ParamType::Bool,      // isApproved
        ParamType::Bool,      // isDisbursed
        ParamType::Bool,      // isRepaid
    ])
}

/// Decode `getLoans(address)`; `loan_index` follows array order
pub fn decode_loans(data: &[u8]) -> Result<Vec<Loan>> {
    let mut tokens = decode(&[ParamType::Array(Box::new(loan_tuple()))], data, "loans")?;
    let entries = tokens
        .remove(0)
        .into_array()
        .ok_or_else(|| SahakariError::Abi("loans is not an array".to_string()))?;

    entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            let fields = entry
                .into_tuple()
                .ok_or_else(|| SahakariError::Abi(format!("loan {} is not a tuple", index)))?;
            if fields.len() != 8 {
                return Err(SahakariError::Abi(format!(
                    "loan {} has {} fields, expected 8",
                    index,
                    fields.len()
                )));
            }
            let mut fields = fields.into_iter();
            let mut next = || {
                fields
                    .next()
                    .ok_or_else(|| SahakariError::Abi(format!("loan {} is truncated", index)))
            };

            Ok(Loan {
                loan_index: index as u64,
                borrower: expect_address(next()?, "borrower")?,
                principal: Usdc::from_raw(expect_uint(next()?, "amount")?),
                eth_collateral: Wei::from_raw(expect_uint(next()?, "ethCollateral")?),
                repayment_amount: Usdc::from_raw(expect_uint(next()?, "repaymentAmount")?),
                due_date: u256_to_u64(expect_uint(next()?, "dueDate")?, "dueDate")?,
                is_approved: expect_bool(next()?, "isApproved")?,
                is_disbursed: expect_bool(next()?, "isDisbursed")?,
                is_repaid: expect_bool(next()?, "isRepaid")?,
            })
        })
        .collect()
}

/// Decode `getMember(address)` returning `(address, string, bool)`
pub fn decode_member(data: &[u8]) -> Result<Member> {
    let mut tokens = decode(
        &[ParamType::Tuple(vec![
            ParamType::Address,
            ParamType::String,
            ParamType::Bool,
        ])],
        data,
        "member",
    )?;
    let fields = tokens
        .remove(0)
        .into_tuple()
        .ok_or_else(|| SahakariError::Abi("member is not a tuple".to_string()))?;
    let [address, name, registered]: [Token; 3] = fields
        .try_into()
        .map_err(|_| SahakariError::Abi("member tuple has wrong arity".to_string()))?;

    Ok(Member {
        address: expect_address(address, "memberAddress")?,
        name: name
            .into_string()
            .ok_or_else(|| SahakariError::Abi("name is not a string".to_string()))?,
        is_registered: expect_bool(registered, "isRegistered")?,
    })
}

/// Encode a loan tuple array, the inverse of [`decode_loans`]
pub fn encode_loans(loans: &[Loan]) -> Bytes {
    let entries = loans
        .iter()
        .map(|loan| {
            Token::Tuple(vec![
                Token::Address(loan.borrower),
                Token::Uint(loan.principal.raw()),
                Token::Uint(loan.eth_collateral.raw()),
                Token::Uint(loan.repayment_amount.raw()),
                Token::Uint(U256::from(loan.due_date)),
                Token::Bool(loan.is_approved),
                Token::Bool(loan.is_disbursed),
                Token::Bool(loan.is_repaid),
            ])
        })
        .collect();
    Bytes::from(abi::encode(&[Token::Array(entries)]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector() {
        // keccak256("approve(address,uint256)")[..4]
        let data = encode_call(
            "approve(address,uint256)",
            &[Token::Address(Address::zero()), Token::Uint(U256::one())],
        );
        assert_eq!(&data[..4], &[0x09, 0x5e, 0xa7, 0xb3]);
        assert_eq!(data.len(), 4 + 64);
    }

    #[test]
    fn test_decode_loans_keeps_insertion_order() {
        let borrower = Address::repeat_byte(0x42);
        let loans: Vec<Loan> = (0..3)
            .map(|i| Loan {
                loan_index: i,
                borrower,
                principal: Usdc::from(1_000_000 * (i + 1)),
                eth_collateral: Wei::from(10 + i),
                repayment_amount: Usdc::from(1_100_000 * (i + 1)),
                due_date: 1_700_000_000 + i,
                is_approved: i > 0,
                is_disbursed: i > 1,
                is_repaid: false,
            })
            .collect();

        let decoded = decode_loans(&encode_loans(&loans)).unwrap();
        assert_eq!(decoded, loans);
    }

    #[test]
    fn test_decode_member() {
        let data = abi::encode(&[Token::Tuple(vec![
            Token::Address(Address::repeat_byte(0x07)),
            Token::String("Sita".to_string()),
            Token::Bool(true),
        ])]);

        let member = decode_member(&data).unwrap();
        assert_eq!(member.address, Address::repeat_byte(0x07));
        assert_eq!(member.name, "Sita");
        assert!(member.is_registered);
    }

    #[test]
    fn test_decode_negative_int() {
        let data = abi::encode(&[Token::Int(I256::from(-5i64).into_raw())]);
        assert!(decode_int(&data).unwrap().is_negative());
    }

    #[test]
    fn test_decode_garbage_is_abi_error() {
        assert!(matches!(
            decode_uint(&[0x01, 0x02]),
            Err(SahakariError::Abi(_))
        ));
    }
}
