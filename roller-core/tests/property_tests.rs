//! Property-based tests for ledger invariants
//!
//! These tests use proptest to verify critical invariants:
//! - The balance projection always agrees with the full transfer log
//! - Rollers are conserved: all balances, the Safe included, sum to zero
//! - Overdrafts are rejected and leave the log untouched
//! - A payment batch exactly covering the pending debits settles them all

use chain_client::{MockChain, Payment};
use proptest::prelude::*;
use roller_core::{Address, Config, Error, Ledger, TxHash};
use std::collections::HashMap;
use std::sync::Arc;

/// Strategy for generating player addresses from a small pool
fn address_strategy() -> impl Strategy<Value = Address> {
    (1u8..=4).prop_map(|digit| Address::new(digit.to_string().repeat(40)).unwrap())
}

/// Strategy for generating transfer attempts between pool players
fn attempt_strategy() -> impl Strategy<Value = (Address, Address, u128)> {
    (address_strategy(), address_strategy(), 1u128..60)
}

/// Create a test ledger over a mock chain, with no bot pool
async fn create_test_ledger(data_dir: &std::path::Path) -> (Ledger, MockChain) {
    let mut config = Config::default();
    config.data_dir = data_dir.to_path_buf();
    config.safe_address = Address::new("f".repeat(40)).unwrap();
    config.bots = vec![];

    let chain = MockChain::new();
    let ledger = Ledger::open(config, Arc::new(chain.clone())).unwrap();
    (ledger, chain)
}

fn unique_tx(index: usize) -> TxHash {
    TxHash::new(format!("{index:0>64}")).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: after any sequence of deposits and transfer attempts,
    /// the projection equals the recomputed log aggregate for every
    /// address, and all balances sum to zero
    #[test]
    fn prop_projection_matches_log(attempts in prop::collection::vec(attempt_strategy(), 1..25)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let temp_dir = tempfile::tempdir().unwrap();
            let (ledger, _chain) = create_test_ledger(temp_dir.path()).await;

            // Seed every player so some attempts succeed.
            let mut model: HashMap<Address, i128> = HashMap::new();
            for digit in 1u8..=4 {
                let player = Address::new(digit.to_string().repeat(40)).unwrap();
                ledger.debug_deposit(&player, 100, unique_tx(digit as usize)).await.unwrap();
                model.insert(player, 100);
            }

            for (source, target, amount) in attempts {
                let covered = model[&source] >= amount as i128;
                let result = ledger.transfer(&source, &target, amount).await;
                if covered {
                    prop_assert!(result.is_ok());
                    *model.get_mut(&source).unwrap() -= amount as i128;
                    *model.get_mut(&target).unwrap() += amount as i128;
                } else {
                    prop_assert!(matches!(result, Err(Error::InsufficientFunds(_))));
                }
            }

            let safe = ledger.prices().safe;
            let mut total = ledger.get_balance(&safe).unwrap();
            for (player, expected) in &model {
                let balance = ledger.get_balance(player).unwrap();
                prop_assert_eq!(balance, *expected);
                prop_assert_eq!(balance, ledger.recompute_balance(player).unwrap());
                total += balance;
            }
            prop_assert_eq!(total, 0);

            ledger.shutdown().await.unwrap();
            Ok(())
        })?;
    }

    /// Property: an overdraft never changes any balance
    #[test]
    fn prop_overdraft_rejected(fund in 1u128..100, excess in 1u128..50) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let temp_dir = tempfile::tempdir().unwrap();
            let (ledger, _chain) = create_test_ledger(temp_dir.path()).await;
            let alice = Address::new("1".repeat(40)).unwrap();
            let bob = Address::new("2".repeat(40)).unwrap();

            ledger.debug_deposit(&alice, fund, unique_tx(0)).await.unwrap();

            let result = ledger.transfer(&alice, &bob, fund + excess).await;
            prop_assert!(matches!(result, Err(Error::InsufficientFunds(_))));
            prop_assert_eq!(ledger.get_balance(&alice).unwrap(), fund as i128);
            prop_assert_eq!(ledger.get_balance(&bob).unwrap(), 0);

            ledger.shutdown().await.unwrap();
            Ok(())
        })?;
    }

    /// Property: a payout batch exactly covering a player's pending
    /// withdrawals settles every one of them
    #[test]
    fn prop_exact_cover_settles_all(amounts in prop::collection::vec(1u128..20, 1..8)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let temp_dir = tempfile::tempdir().unwrap();
            let (ledger, chain) = create_test_ledger(temp_dir.path()).await;
            let alice = Address::new("1".repeat(40)).unwrap();

            let total: u128 = amounts.iter().sum();
            ledger.debug_deposit(&alice, total, unique_tx(0)).await.unwrap();
            for amount in &amounts {
                ledger.withdraw(&alice, *amount).await.unwrap();
            }
            prop_assert_eq!(ledger.get_unsettled_withdrawals().unwrap().len(), amounts.len());

            let batch = TxHash::new("b".repeat(64)).unwrap();
            chain.set_payments(batch.as_str(), vec![Payment {
                address: alice.as_str().to_string(),
                amount_wei: total * 70_000_000_000_000,
            }]).await;

            let outcome = ledger.settle(&batch).await.unwrap();
            prop_assert_eq!(outcome.settled_count, amounts.len());
            prop_assert_eq!(outcome.remaining_unsettled, 0);
            prop_assert!(ledger.get_unsettled_withdrawals().unwrap().is_empty());

            ledger.shutdown().await.unwrap();
            Ok(())
        })?;
    }
}
