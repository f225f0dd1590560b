use alloy_primitives::{Address, Bytes, B256, U256};

use crate::{state::State, storage::error::StateError};

/// Block-level context a transaction executes under.
#[derive(Debug, Clone, Default)]
pub struct EnvInfo {
    pub number: u64,
    pub author: Address,
    pub timestamp: u64,
    pub gas_limit: U256,
    /// Gas already used by earlier transactions in the block.
    pub gas_used: U256,
}

/// Chain constants the engine consults during execution.
#[derive(Debug, Clone)]
pub struct ChainParams {
    pub account_start_nonce: U256,
    /// Block number from which touched-and-empty accounts are pruned on
    /// commit.
    pub eip158_fork_block: u64,
}

pub trait SealEngine {
    fn chain_params(&self) -> &ChainParams;
}

/// The transaction as the engine sees it; consumed by the executive.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    pub sender: Address,
    /// `None` is contract creation.
    pub to: Option<Address>,
    pub nonce: U256,
    pub value: U256,
    pub gas: U256,
    pub data: Bytes,
}

/// Whether the cache outcome of an execution is kept or dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permanence {
    Committed,
    Reverted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

/// VM-level faults; these are data in the receipt, never `Err` — a faulted
/// transaction still commits its fee and nonce effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionException {
    #[default]
    None,
    OutOfGas,
    BadInstruction,
    RevertInstruction,
    InvalidNonce,
    NotEnoughCash,
    BlockGasLimitReached,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub gas_used: U256,
    pub excepted: TransactionException,
    pub output: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionReceipt {
    pub state_root: B256,
    pub cumulative_gas_used: U256,
    pub logs: Vec<LogEntry>,
}

/// Per-opcode observer: `(step, opcode, gas_left)`.
pub type OnOpFn<'a> = dyn FnMut(u64, u8, U256) + 'a;

/// The external VM driver.
///
/// [`State::execute`] owns the phase discipline: `initialize` validates the
/// transaction cheaply and fails fast; `execute` returns `true` when it
/// completed the transaction without running the VM; `go` drives the VM to
/// completion, recording faults rather than returning them; `finalize`
/// applies suicides, refunds and fee transfers into the state cache and
/// yields the result.
pub trait Executive {
    fn initialize(
        &mut self,
        state: &mut State,
        env: &EnvInfo,
        tx: &Transaction,
    ) -> Result<(), StateError>;

    fn execute(&mut self, state: &mut State) -> Result<bool, StateError>;

    fn go(&mut self, state: &mut State, on_op: Option<&mut OnOpFn<'_>>) -> Result<(), StateError>;

    fn finalize(&mut self, state: &mut State) -> Result<ExecutionResult, StateError>;

    fn logs(&self) -> &[LogEntry];
}
