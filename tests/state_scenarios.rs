use std::sync::Arc;

use alloy_consensus::{constants::KECCAK_EMPTY, EMPTY_ROOT_HASH};
use alloy_primitives::{keccak256, Address, Bytes, U256};
use merkle_state::{
    storage::utils::{create_temp_test_dir, setup_rocksdb},
    BaseState, ChainParams, CodeSizeCache, CommitBehaviour, EnvInfo, Executive, ExecutionResult,
    LogEntry, OnOpFn, OverlayDB, Permanence, SealEngine, State, StateConfig, StateError,
    Transaction, TransactionException,
};
use tempfile::TempDir;

fn new_state_with(config: StateConfig) -> (TempDir, State) {
    let temp_directory = create_temp_test_dir().unwrap();
    let rocksdb = setup_rocksdb(temp_directory.path().to_path_buf()).unwrap();
    let db = OverlayDB::new(false, Arc::new(rocksdb));
    let state = State::with_config(
        U256::ZERO,
        db,
        BaseState::Empty,
        config,
        CodeSizeCache::new(),
    );
    (temp_directory, state)
}

fn new_state() -> (TempDir, State) {
    new_state_with(StateConfig::default())
}

fn addr(n: u8) -> Address {
    Address::with_last_byte(n)
}

struct TestEngine {
    params: ChainParams,
}

impl TestEngine {
    fn with_fork_block(eip158_fork_block: u64) -> Self {
        Self {
            params: ChainParams {
                account_start_nonce: U256::ZERO,
                eip158_fork_block,
            },
        }
    }
}

impl SealEngine for TestEngine {
    fn chain_params(&self) -> &ChainParams {
        &self.params
    }
}

/// Just enough of a VM to drive the execute wrapper: validates the nonce,
/// moves value from sender to recipient and charges a flat 21k gas.
#[derive(Default)]
struct TransferExecutive {
    tx: Transaction,
    gas_used: U256,
    ops_seen: u64,
    logs: Vec<LogEntry>,
}

impl Executive for TransferExecutive {
    fn initialize(
        &mut self,
        state: &mut State,
        _env: &EnvInfo,
        tx: &Transaction,
    ) -> Result<(), StateError> {
        let expected = state.nonce(tx.sender)?;
        if tx.nonce != expected {
            return Err(StateError::InvalidTransaction(format!(
                "nonce mismatch: expected {expected}, got {}",
                tx.nonce
            )));
        }
        self.tx = tx.clone();
        Ok(())
    }

    fn execute(&mut self, _state: &mut State) -> Result<bool, StateError> {
        Ok(false)
    }

    fn go(&mut self, state: &mut State, on_op: Option<&mut OnOpFn<'_>>) -> Result<(), StateError> {
        if let Some(on_op) = on_op {
            on_op(0, 0x00, self.tx.gas);
            self.ops_seen += 1;
        }
        let recipient = self.tx.to.unwrap_or_default();
        state.inc_nonce(self.tx.sender)?;
        state.sub_balance(self.tx.sender, self.tx.value)?;
        state.add_balance(recipient, self.tx.value)?;
        self.gas_used = U256::from(21_000);
        self.logs.push(LogEntry {
            address: recipient,
            topics: vec![keccak256(b"transfer")],
            data: Bytes::new(),
        });
        Ok(())
    }

    fn finalize(&mut self, _state: &mut State) -> Result<ExecutionResult, StateError> {
        Ok(ExecutionResult {
            gas_used: self.gas_used,
            excepted: TransactionException::None,
            output: Bytes::new(),
        })
    }

    fn logs(&self) -> &[LogEntry] {
        &self.logs
    }
}

#[test]
fn genesis_transfer() {
    let (_dir, mut state) = new_state();
    state.add_balance(addr(0x01), U256::from(100)).unwrap();
    state.commit(CommitBehaviour::KeepEmptyAccounts).unwrap();

    assert_eq!(state.balance(addr(0x01)).unwrap(), U256::from(100));
    assert_eq!(state.nonce(addr(0x01)).unwrap(), U256::ZERO);
    assert_ne!(state.root_hash().unwrap(), EMPTY_ROOT_HASH);
}

#[test]
fn rewinding_to_the_root_drops_uncommitted_changes() {
    let (_dir, mut state) = new_state();
    state.add_balance(addr(0x01), U256::from(100)).unwrap();
    let root = state.commit(CommitBehaviour::KeepEmptyAccounts).unwrap();

    state.sub_balance(addr(0x01), U256::from(50)).unwrap();
    state.add_balance(addr(0x02), U256::from(50)).unwrap();
    state.set_root(root).unwrap();

    assert_eq!(state.balance(addr(0x01)).unwrap(), U256::from(100));
    assert_eq!(state.balance(addr(0x02)).unwrap(), U256::ZERO);
    assert_eq!(state.root_hash().unwrap(), root);
}

#[test]
fn empty_account_prune() {
    let (_dir, mut state) = new_state();
    state.ensure_account_exists(addr(0x03)).unwrap();
    state.commit(CommitBehaviour::RemoveEmptyAccounts).unwrap();
    assert!(!state.address_in_use(addr(0x03)).unwrap());
    assert_eq!(state.root_hash().unwrap(), EMPTY_ROOT_HASH);

    state.ensure_account_exists(addr(0x03)).unwrap();
    state.commit(CommitBehaviour::KeepEmptyAccounts).unwrap();
    assert!(state.address_in_use(addr(0x03)).unwrap());
    assert!(!state.account_nonempty_and_existing(addr(0x03)).unwrap());
}

#[test]
fn storage_overlay_survives_reopen_and_zero_deletes() {
    let (_dir, mut state) = new_state();
    let a = addr(0x0a);
    state.set_storage(a, U256::from(0x7), U256::from(0x2a)).unwrap();
    assert_eq!(state.storage(a, U256::from(0x7)).unwrap(), U256::from(0x2a));
    let root = state.commit(CommitBehaviour::KeepEmptyAccounts).unwrap();

    let mut reopened = State::from_existing(state.db().clone(), root).unwrap();
    reopened.note_account_start_nonce(U256::ZERO).unwrap();
    assert_eq!(
        reopened.storage(a, U256::from(0x7)).unwrap(),
        U256::from(0x2a)
    );

    reopened.set_storage(a, U256::from(0x7), U256::ZERO).unwrap();
    reopened.commit(CommitBehaviour::KeepEmptyAccounts).unwrap();
    assert_eq!(reopened.storage(a, U256::from(0x7)).unwrap(), U256::ZERO);
    assert_eq!(reopened.storage_root(a).unwrap(), EMPTY_ROOT_HASH);
}

#[test]
fn contract_creation_preserves_balance() {
    let (_dir, mut state) = new_state();
    let c = addr(0x0c);
    state.add_balance(c, U256::from(7)).unwrap();
    state.create_contract(c, true).unwrap();

    assert_eq!(state.balance(c).unwrap(), U256::from(7));
    assert_eq!(state.nonce(c).unwrap(), U256::from(1));
}

#[test]
fn insufficient_funds_fail_and_leave_balance_alone() {
    let (_dir, mut state) = new_state();
    let a = addr(0x0a);
    state.add_balance(a, U256::from(5)).unwrap();
    match state.sub_balance(a, U256::from(10)) {
        Err(StateError::NotEnoughCash { balance, required }) => {
            assert_eq!(balance, U256::from(5));
            assert_eq!(required, U256::from(10));
        }
        other => panic!("expected NotEnoughCash, got {other:?}"),
    }
    assert_eq!(state.balance(a).unwrap(), U256::from(5));
}

#[test]
fn root_depends_only_on_final_account_states() {
    let (_dir1, mut one) = new_state();
    one.add_balance(addr(1), U256::from(100)).unwrap();
    one.add_balance(addr(2), U256::from(50)).unwrap();
    one.inc_nonce(addr(1)).unwrap();
    let root_one = one.commit(CommitBehaviour::KeepEmptyAccounts).unwrap();

    let (_dir2, mut two) = new_state();
    two.add_balance(addr(2), U256::from(50)).unwrap();
    two.add_balance(addr(1), U256::from(40)).unwrap();
    // Interleaved observations must not affect the outcome.
    two.balance(addr(2)).unwrap();
    two.nonce(addr(1)).unwrap();
    two.inc_nonce(addr(1)).unwrap();
    two.add_balance(addr(1), U256::from(60)).unwrap();
    let root_two = two.commit(CommitBehaviour::KeepEmptyAccounts).unwrap();

    assert_eq!(root_one, root_two);
}

#[test]
fn storage_read_through_is_stable_across_unrelated_commits() {
    let (_dir, mut state) = new_state();
    let a = addr(0x0a);
    state.set_storage(a, U256::from(3), U256::from(33)).unwrap();
    state.commit(CommitBehaviour::KeepEmptyAccounts).unwrap();

    let before = state.storage(a, U256::from(3)).unwrap();
    state.add_balance(addr(0x0b), U256::from(1)).unwrap();
    state.commit(CommitBehaviour::KeepEmptyAccounts).unwrap();
    let after = state.storage(a, U256::from(3)).unwrap();

    assert_eq!(before, U256::from(33));
    assert_eq!(before, after);
}

#[test]
fn balance_conservation_under_transfer() {
    let (_dir, mut state) = new_state();
    let a = addr(0x0a);
    let b = addr(0x0b);
    state.add_balance(a, U256::from(70)).unwrap();
    state.add_balance(b, U256::from(30)).unwrap();

    state.transfer_balance(a, b, U256::from(25)).unwrap();
    assert_eq!(state.balance(a).unwrap(), U256::from(45));
    assert_eq!(state.balance(b).unwrap(), U256::from(55));

    // A failing transfer changes neither side.
    assert!(state.transfer_balance(a, b, U256::from(1000)).is_err());
    assert_eq!(state.balance(a).unwrap(), U256::from(45));
    assert_eq!(state.balance(b).unwrap(), U256::from(55));
}

#[test]
fn inc_nonce_strictly_increases() {
    let (_dir, mut state) = new_state();
    let a = addr(0x01);
    assert_eq!(state.nonce(a).unwrap(), U256::ZERO);
    state.inc_nonce(a).unwrap();
    assert_eq!(state.nonce(a).unwrap(), U256::from(1));
    state.inc_nonce(a).unwrap();
    assert_eq!(state.nonce(a).unwrap(), U256::from(2));
}

#[test]
fn code_round_trips_through_commit_and_reopen() {
    let (_dir, mut state) = new_state();
    let c = addr(0x0c);
    let bytecode = Bytes::from(vec![0x60, 0x80, 0x60, 0x40, 0x52]);

    state.create_contract(c, true).unwrap();
    state.set_code(c, bytecode.clone()).unwrap();
    assert_eq!(state.code_hash(c).unwrap(), keccak256(&bytecode));
    let root = state.commit(CommitBehaviour::KeepEmptyAccounts).unwrap();

    let mut reopened = State::from_existing(state.db().clone(), root).unwrap();
    reopened.note_account_start_nonce(U256::ZERO).unwrap();
    assert_eq!(reopened.code(c).unwrap(), bytecode);
    assert_eq!(reopened.code_hash(c).unwrap(), keccak256(&bytecode));
    assert_eq!(reopened.code_size(c).unwrap(), bytecode.len());
    assert!(reopened.address_has_code(c).unwrap());
}

#[test]
fn eviction_does_not_change_observable_behaviour() {
    let evicting_config = StateConfig {
        cache_soft_limit: 4,
        eviction_seed: Some(7),
        ..StateConfig::default()
    };
    let (_dir1, mut evicting) = new_state_with(evicting_config);
    let (_dir2, mut plain) = new_state();

    for state in [&mut evicting, &mut plain] {
        for n in 0..50u8 {
            state.add_balance(addr(n), U256::from(n as u64 + 1)).unwrap();
        }
        state.commit(CommitBehaviour::KeepEmptyAccounts).unwrap();
    }

    // Flood the evicting state's candidate pool far past its limit.
    for n in 0..50u8 {
        evicting.balance(addr(n)).unwrap();
    }

    for state in [&mut evicting, &mut plain] {
        for n in 0..5u8 {
            state.add_balance(addr(n), U256::from(1000)).unwrap();
        }
        state
            .set_storage(addr(3), U256::from(1), U256::from(99))
            .unwrap();
        state.commit(CommitBehaviour::KeepEmptyAccounts).unwrap();
    }

    assert_eq!(evicting.root_hash().unwrap(), plain.root_hash().unwrap());
}

#[test]
fn snapshot_is_independent_of_the_original() {
    let (_dir, mut state) = new_state();
    let a = addr(0x0a);
    state.add_balance(a, U256::from(10)).unwrap();
    state.commit(CommitBehaviour::KeepEmptyAccounts).unwrap();

    let mut snapshot = state.snapshot().unwrap();
    snapshot.add_balance(a, U256::from(90)).unwrap();
    snapshot.add_balance(addr(0x0b), U256::from(5)).unwrap();

    assert_eq!(state.balance(a).unwrap(), U256::from(10));
    assert!(!state.address_in_use(addr(0x0b)).unwrap());

    let original_root = state.commit(CommitBehaviour::KeepEmptyAccounts).unwrap();
    let snapshot_root = snapshot.commit(CommitBehaviour::KeepEmptyAccounts).unwrap();
    assert_ne!(original_root, snapshot_root);
    assert_eq!(snapshot.balance(a).unwrap(), U256::from(100));
}

#[test]
fn reading_nonce_without_a_start_nonce_fails() {
    let (_dir, mut state) = new_state();
    let root = state.commit(CommitBehaviour::KeepEmptyAccounts).unwrap();
    let opened = State::from_existing(state.db().clone(), root).unwrap();
    assert!(matches!(
        opened.nonce(addr(0x01)),
        Err(StateError::InvalidAccountStartNonce)
    ));
}

#[test]
fn execute_commits_a_transfer_and_builds_the_receipt() {
    let (_dir, mut state) = new_state();
    let sender = addr(0x0a);
    let recipient = addr(0x0b);
    state.add_balance(sender, U256::from(1000)).unwrap();
    state.commit(CommitBehaviour::KeepEmptyAccounts).unwrap();

    let env = EnvInfo {
        number: 1,
        gas_used: U256::from(5_000),
        ..EnvInfo::default()
    };
    let engine = TestEngine::with_fork_block(u64::MAX);
    let tx = Transaction {
        sender,
        to: Some(recipient),
        nonce: U256::ZERO,
        value: U256::from(400),
        gas: U256::from(100_000),
        data: Bytes::new(),
    };
    let mut executive = TransferExecutive::default();

    let (result, receipt) = state
        .execute(
            &env,
            &engine,
            &tx,
            &mut executive,
            Permanence::Committed,
            None,
        )
        .unwrap();

    assert_eq!(result.excepted, TransactionException::None);
    assert_eq!(result.gas_used, U256::from(21_000));
    assert_eq!(receipt.cumulative_gas_used, U256::from(26_000));
    assert_eq!(receipt.state_root, state.root_hash().unwrap());
    assert_eq!(receipt.logs.len(), 1);
    assert_eq!(state.balance(sender).unwrap(), U256::from(600));
    assert_eq!(state.balance(recipient).unwrap(), U256::from(400));
    assert_eq!(state.nonce(sender).unwrap(), U256::from(1));
    assert!(state.touched().contains(&sender));
    assert!(state.touched().contains(&recipient));
}

#[test]
fn execute_reverted_leaves_root_and_cache_untouched() {
    let (_dir, mut state) = new_state();
    let sender = addr(0x0a);
    state.add_balance(sender, U256::from(1000)).unwrap();
    let root = state.commit(CommitBehaviour::KeepEmptyAccounts).unwrap();

    let env = EnvInfo::default();
    let engine = TestEngine::with_fork_block(u64::MAX);
    let tx = Transaction {
        sender,
        to: Some(addr(0x0b)),
        nonce: U256::ZERO,
        value: U256::from(400),
        gas: U256::from(100_000),
        data: Bytes::new(),
    };
    let mut executive = TransferExecutive::default();

    state
        .execute(
            &env,
            &engine,
            &tx,
            &mut executive,
            Permanence::Reverted,
            None,
        )
        .unwrap();

    assert_eq!(state.root_hash().unwrap(), root);
    assert_eq!(state.balance(sender).unwrap(), U256::from(1000));
    assert_eq!(state.balance(addr(0x0b)).unwrap(), U256::ZERO);
    assert_eq!(state.nonce(sender).unwrap(), U256::ZERO);
}

#[test]
fn execute_prunes_empty_recipients_from_the_fork_block() {
    for (block_number, expect_in_use) in [(99u64, true), (100u64, false)] {
        let (_dir, mut state) = new_state();
        let sender = addr(0x0a);
        let recipient = addr(0x0b);
        state.add_balance(sender, U256::from(1000)).unwrap();
        state.commit(CommitBehaviour::KeepEmptyAccounts).unwrap();

        let env = EnvInfo {
            number: block_number,
            ..EnvInfo::default()
        };
        let engine = TestEngine::with_fork_block(100);
        // A zero-value transfer leaves the recipient touched but empty.
        let tx = Transaction {
            sender,
            to: Some(recipient),
            nonce: U256::ZERO,
            value: U256::ZERO,
            gas: U256::from(100_000),
            data: Bytes::new(),
        };
        let mut executive = TransferExecutive::default();
        state
            .execute(
                &env,
                &engine,
                &tx,
                &mut executive,
                Permanence::Committed,
                None,
            )
            .unwrap();

        assert_eq!(
            state.address_in_use(recipient).unwrap(),
            expect_in_use,
            "block {block_number}"
        );
    }
}

#[test]
fn execute_rejects_a_bad_nonce_before_touching_state() {
    let (_dir, mut state) = new_state();
    let sender = addr(0x0a);
    state.add_balance(sender, U256::from(1000)).unwrap();
    let root = state.commit(CommitBehaviour::KeepEmptyAccounts).unwrap();

    let env = EnvInfo::default();
    let engine = TestEngine::with_fork_block(u64::MAX);
    let tx = Transaction {
        sender,
        to: Some(addr(0x0b)),
        nonce: U256::from(5),
        value: U256::from(1),
        gas: U256::from(100_000),
        data: Bytes::new(),
    };
    let mut executive = TransferExecutive::default();

    assert!(matches!(
        state.execute(
            &env,
            &engine,
            &tx,
            &mut executive,
            Permanence::Committed,
            None
        ),
        Err(StateError::InvalidTransaction(_))
    ));
    assert_eq!(state.root_hash().unwrap(), root);
}

#[test]
fn on_op_observer_is_driven_by_the_vm() {
    let (_dir, mut state) = new_state();
    let sender = addr(0x0a);
    state.add_balance(sender, U256::from(1000)).unwrap();
    state.commit(CommitBehaviour::KeepEmptyAccounts).unwrap();

    let env = EnvInfo::default();
    let engine = TestEngine::with_fork_block(u64::MAX);
    let tx = Transaction {
        sender,
        to: Some(addr(0x0b)),
        nonce: U256::ZERO,
        value: U256::from(1),
        gas: U256::from(100_000),
        data: Bytes::new(),
    };
    let mut executive = TransferExecutive::default();

    let mut seen: Vec<(u64, u8)> = Vec::new();
    let mut observer = |step: u64, opcode: u8, _gas_left: U256| {
        seen.push((step, opcode));
    };
    state
        .execute(
            &env,
            &engine,
            &tx,
            &mut executive,
            Permanence::Committed,
            Some(&mut observer),
        )
        .unwrap();

    assert_eq!(seen, vec![(0, 0x00)]);
    assert_eq!(executive.ops_seen, 1);
}

#[test]
fn paranoid_checks_pass_on_a_healthy_state() {
    let config = StateConfig {
        paranoid_checks: true,
        ..StateConfig::default()
    };
    let (_dir, mut state) = new_state_with(config);
    let c = addr(0x0c);
    state.add_balance(c, U256::from(1)).unwrap();
    state.set_code(c, Bytes::from(vec![0x60, 0x01])).unwrap();
    state.set_storage(c, U256::from(1), U256::from(2)).unwrap();
    state.commit(CommitBehaviour::KeepEmptyAccounts).unwrap();
    assert!(state.is_trie_good(true));
}

#[test]
fn killed_account_code_hash_reads_empty() {
    let (_dir, mut state) = new_state();
    let c = addr(0x0c);
    state.create_contract(c, true).unwrap();
    state.set_code(c, Bytes::from(vec![0x01, 0x02])).unwrap();
    state.commit(CommitBehaviour::KeepEmptyAccounts).unwrap();

    state.kill(c).unwrap();
    assert_eq!(state.code_hash(c).unwrap(), KECCAK_EMPTY);
    state.commit(CommitBehaviour::KeepEmptyAccounts).unwrap();
    assert!(!state.address_in_use(c).unwrap());

    // Killing an address the trie never knew is a quiet no-op.
    state.kill(addr(0x7f)).unwrap();
    state.commit(CommitBehaviour::KeepEmptyAccounts).unwrap();
}
