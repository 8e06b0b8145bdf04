//! Calldata and event layouts of the escrow and oracle contracts.

use super::{ChainError, ChainResult, LockPaymentCall, TxLog};
use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::{id, keccak256};

pub const LOCK_PAYMENT_SIGNATURE: &str = "lockTokenPayment((string,uint256,uint256))";
pub const UNLOCK_PAYMENT_SIGNATURE: &str = "unlockCarPayment(string,address)";
pub const REFUND_SIGNATURE: &str = "refund(string[])";
pub const PAYMENT_AVAILABLE_SIGNATURE: &str = "isCarPaymentAvailable(string,address)";
pub const UNLOCK_EVENT_SIGNATURE: &str = "UnlockPayment(string,uint256,address)";

/// One `UnlockPayment` log emitted by the escrow
#[derive(Debug, Clone, PartialEq)]
pub struct UnlockEventLog {
    pub deal_id: String,
    pub amount: U256,
    pub recipient: Address,
}

fn call(signature: &str, args: &[Token]) -> Bytes {
    let mut data = id(signature).to_vec();
    data.extend(abi::encode(args));
    Bytes::from(data)
}

pub fn encode_lock_payment(payment: &LockPaymentCall) -> ChainResult<Bytes> {
    let lock_time = u64::try_from(payment.lock_time)
        .map_err(|_| ChainError::Abi(format!("negative lock time {}", payment.lock_time)))?;
    Ok(call(
        LOCK_PAYMENT_SIGNATURE,
        &[Token::Tuple(vec![
            Token::String(payment.content_id.clone()),
            Token::Uint(U256::from(lock_time)),
            Token::Uint(payment.amount),
        ])],
    ))
}

pub fn encode_unlock_payment(deal_id: &str, recipient: Address) -> Bytes {
    call(
        UNLOCK_PAYMENT_SIGNATURE,
        &[Token::String(deal_id.to_string()), Token::Address(recipient)],
    )
}

pub fn encode_refund(content_ids: &[String]) -> Bytes {
    let ids = content_ids.iter().cloned().map(Token::String).collect();
    call(REFUND_SIGNATURE, &[Token::Array(ids)])
}

pub fn encode_payment_available(deal_id: &str, recipient: Address) -> Bytes {
    call(
        PAYMENT_AVAILABLE_SIGNATURE,
        &[Token::String(deal_id.to_string()), Token::Address(recipient)],
    )
}

pub fn decode_bool(output: &[u8]) -> ChainResult<bool> {
    let tokens = abi::decode(&[ParamType::Bool], output).map_err(|e| ChainError::Abi(e.to_string()))?;
    match tokens.as_slice() {
        [Token::Bool(value)] => Ok(*value),
        other => Err(ChainError::Abi(format!("unexpected oracle output {other:?}"))),
    }
}

pub fn unlock_event_topic() -> H256 {
    H256::from(keccak256(UNLOCK_EVENT_SIGNATURE))
}

/// Decode every `UnlockPayment` log emitted by `escrow`. Logs from other
/// contracts or with other topics are skipped; a matching log whose data
/// does not decode is an error.
pub fn decode_unlock_events(logs: &[TxLog], escrow: Address) -> ChainResult<Vec<UnlockEventLog>> {
    let topic = unlock_event_topic();
    let layout = [ParamType::String, ParamType::Uint(256), ParamType::Address];

    let mut events = Vec::new();
    for log in logs {
        if log.address != escrow || log.topics.first() != Some(&topic) {
            continue;
        }
        let tokens = abi::decode(&layout, &log.data).map_err(|e| ChainError::Abi(e.to_string()))?;
        match tokens.as_slice() {
            [Token::String(deal_id), Token::Uint(amount), Token::Address(recipient)] => events.push(UnlockEventLog {
                deal_id: deal_id.clone(),
                amount: *amount,
                recipient: *recipient,
            }),
            other => return Err(ChainError::Abi(format!("unexpected unlock event layout {other:?}"))),
        }
    }
    Ok(events)
}

/// Build the log an escrow emits for an unlock. Used by gateways that
/// simulate the escrow.
pub fn unlock_event_log(escrow: Address, event: &UnlockEventLog) -> TxLog {
    TxLog {
        address: escrow,
        topics: vec![unlock_event_topic()],
        data: abi::encode(&[
            Token::String(event.deal_id.clone()),
            Token::Uint(event.amount),
            Token::Address(event.recipient),
        ]),
    }
}
