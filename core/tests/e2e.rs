use std::sync::Arc;

use custodian_core::interface::{load_escrow_data, save_escrow_data};
use custodian_core::mock::{Fault, MockKey, MockLedger};
use custodian_core::{
    Address, AssetRef, EscrowEngine, EscrowError, EscrowInstance, FailureKind, Lamports,
    LedgerError, LegOutcome, LegProgress, Phase, SkipReason,
};

const CUSTODIAN: Address = Address::new([1u8; 32]);
const SELLER: Address = Address::new([2u8; 32]);
const BUYER: Address = Address::new([3u8; 32]);
const STRANGER: Address = Address::new([4u8; 32]);
const ASSET_X: Address = Address::new([9u8; 32]);

const PRICE: Lamports = Lamports(2_500_000_000);
// keeps balances above the escrowed value
const FEE_BUFFER: Lamports = Lamports(10_000_000);

fn engine(ledger: &MockLedger, key: Address) -> EscrowEngine<MockLedger, MockLedger> {
    EscrowEngine::new(ledger.clone(), ledger.clone(), Arc::new(MockKey(key)))
}

fn asset() -> AssetRef {
    AssetRef::from(ASSET_X)
}

fn deal() -> EscrowInstance {
    EscrowInstance::new("deal-x", CUSTODIAN, Some(asset()), PRICE).unwrap()
}

/// Seller owns X, buyer holds the price plus fees.
fn market() -> MockLedger {
    let ledger = MockLedger::new();
    ledger.mint(asset(), SELLER);
    ledger.fund(BUYER, Lamports(PRICE.0 + FEE_BUFFER.0));
    ledger
}

/// Runs both deposits, leaving the record `FullyDeposited`.
async fn deposited(ledger: &MockLedger) -> EscrowInstance {
    let mut record = deal();
    engine(ledger, SELLER)
        .deposit_asset(&mut record)
        .await
        .unwrap();
    engine(ledger, BUYER).deposit_value(&mut record).await.unwrap();
    assert_eq!(record.phase(), Phase::FullyDeposited);
    record
}

#[tokio::test]
async fn deposit_then_release() {
    let ledger = market();
    let mut record = deal();

    let outcome = engine(&ledger, SELLER)
        .deposit_asset(&mut record)
        .await
        .unwrap();
    assert!(matches!(outcome, LegOutcome::Confirmed(_)));
    assert_eq!(record.phase(), Phase::AssetDeposited);
    assert_eq!(ledger.owner(&asset()), Some(CUSTODIAN));
    assert_eq!(record.seller(), Some(SELLER));

    engine(&ledger, BUYER)
        .deposit_value(&mut record)
        .await
        .unwrap();
    assert_eq!(record.phase(), Phase::FullyDeposited);
    assert_eq!(ledger.balance_of(&CUSTODIAN), PRICE);
    assert_eq!(record.buyer(), Some(BUYER));

    let settlement = engine(&ledger, CUSTODIAN)
        .release(&mut record)
        .await
        .unwrap();
    assert!(settlement.is_complete());
    assert_eq!(settlement.phase, Phase::Released);
    assert_eq!(settlement.confirmed_legs(), vec!["asset", "value"]);
    assert_eq!(record.phase(), Phase::Released);
    assert_eq!(ledger.owner(&asset()), Some(BUYER));
    assert_eq!(ledger.balance_of(&SELLER), PRICE);
    assert_eq!(ledger.balance_of(&CUSTODIAN), Lamports::ZERO);

    // terminal: a second release is rejected before touching the network
    let calls = ledger.calls();
    assert!(matches!(
        engine(&ledger, CUSTODIAN).release(&mut record).await,
        Err(EscrowError::InvalidTransition { .. })
    ));
    assert_eq!(ledger.calls(), calls);
}

#[tokio::test]
async fn deposit_asset_requires_ownership() {
    let ledger = market();
    let mut record = deal();

    let err = engine(&ledger, STRANGER)
        .deposit_asset(&mut record)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        EscrowError::NotOwner {
            party: STRANGER,
            owner: SELLER
        }
    );
    assert_eq!(record.phase(), Phase::Empty);
    assert_eq!(ledger.calls().asset_transfers, 0);

    ledger.burn(&asset());
    assert_eq!(
        engine(&ledger, SELLER).deposit_asset(&mut record).await,
        Err(EscrowError::AssetNotFound(asset()))
    );
}

#[tokio::test]
async fn deposit_asset_already_in_custody_is_recorded_without_transfer() {
    let ledger = market();
    let mut record = deal();
    ledger.fail_next_asset_transfer(Fault::TimeoutLanded);

    let err = engine(&ledger, SELLER)
        .deposit_asset(&mut record)
        .await
        .unwrap_err();
    assert!(matches!(err, EscrowError::Transfer(ref f) if f.kind == FailureKind::Timeout));
    assert_eq!(record.phase(), Phase::Empty);
    assert!(record.deposits().asset.in_flight().is_some());

    // the timed-out transfer landed; retry observes it instead of resending
    let outcome = engine(&ledger, SELLER)
        .deposit_asset(&mut record)
        .await
        .unwrap();
    assert_eq!(outcome, LegOutcome::Skipped(SkipReason::AlreadyInCustody));
    assert_eq!(record.phase(), Phase::AssetDeposited);
    assert_eq!(ledger.calls().asset_transfers, 1);
}

#[tokio::test]
async fn deposit_value_rechecks_in_flight_transfer() {
    let ledger = market();
    let mut record = deal();
    ledger.fail_next_value_transfer(Fault::TimeoutPending);

    let buyer = engine(&ledger, BUYER);
    assert!(buyer.deposit_value(&mut record).await.is_err());
    assert_eq!(record.phase(), Phase::Empty);

    // still pending: no resubmission
    let err = buyer.deposit_value(&mut record).await.unwrap_err();
    assert!(matches!(err, EscrowError::Transfer(ref f) if f.tx.is_some()));
    assert_eq!(ledger.calls().value_transfers, 1);

    ledger.settle_pending();
    let outcome = buyer.deposit_value(&mut record).await.unwrap();
    assert!(matches!(
        outcome,
        LegOutcome::Skipped(SkipReason::AlreadyConfirmed(_))
    ));
    assert_eq!(record.phase(), Phase::ValueDeposited);
    assert_eq!(ledger.calls().value_transfers, 1);
    assert_eq!(ledger.balance_of(&CUSTODIAN), PRICE);
}

#[tokio::test]
async fn repeated_deposit_is_rejected() {
    let ledger = market();
    let mut record = deposited(&ledger).await;

    assert!(matches!(
        engine(&ledger, BUYER).deposit_value(&mut record).await,
        Err(EscrowError::InvalidTransition { .. })
    ));
    assert!(matches!(
        engine(&ledger, SELLER).deposit_asset(&mut record).await,
        Err(EscrowError::InvalidTransition { .. })
    ));
    assert_eq!(record.phase(), Phase::FullyDeposited);
}

#[tokio::test]
async fn release_retry_only_attempts_the_outstanding_leg() {
    let ledger = market();
    let mut record = deposited(&ledger).await;
    let custodian = engine(&ledger, CUSTODIAN);
    ledger.fail_next_value_transfer(Fault::TimeoutDropped);

    let first = custodian.release(&mut record).await.unwrap();
    assert!(matches!(first.asset, LegOutcome::Confirmed(_)));
    assert_eq!(first.value.failure().unwrap().kind, FailureKind::Timeout);
    assert_eq!(first.phase, Phase::PartiallyReleased);
    assert!(!first.is_complete());
    assert_eq!(first.confirmed_legs(), vec!["asset"]);

    let before = ledger.calls();
    let second = custodian.release(&mut record).await.unwrap();
    let after = ledger.calls();

    assert_eq!(second.asset, LegOutcome::Skipped(SkipReason::AlreadySettled));
    assert!(matches!(second.value, LegOutcome::Confirmed(_)));
    assert_eq!(second.phase, Phase::Released);
    assert_eq!(after.asset_transfers, before.asset_transfers);
    assert_eq!(after.owner_queries, before.owner_queries);
    assert_eq!(after.value_transfers, before.value_transfers + 1);
    assert_eq!(ledger.balance_of(&SELLER), PRICE);
}

#[tokio::test]
async fn release_after_value_timeout_that_landed_does_not_pay_twice() {
    let ledger = market();
    let mut record = deposited(&ledger).await;
    let custodian = engine(&ledger, CUSTODIAN);
    ledger.fail_next_value_transfer(Fault::TimeoutLanded);

    let first = custodian.release(&mut record).await.unwrap();
    assert_eq!(first.phase, Phase::PartiallyReleased);
    assert!(matches!(
        record.settlement().value,
        LegProgress::InFlight { .. }
    ));

    let second = custodian.release(&mut record).await.unwrap();
    assert!(matches!(
        second.value,
        LegOutcome::Skipped(SkipReason::AlreadyConfirmed(_))
    ));
    assert_eq!(second.phase, Phase::Released);
    assert_eq!(ledger.calls().value_transfers, 2); // deposit + one release
    assert_eq!(ledger.balance_of(&SELLER), PRICE);
}

#[tokio::test]
async fn asset_timeout_then_retry_completes_release() {
    let ledger = market();
    let mut record = deposited(&ledger).await;
    let custodian = engine(&ledger, CUSTODIAN);
    ledger.fail_next_asset_transfer(Fault::TimeoutDropped);

    let first = custodian.release(&mut record).await.unwrap();
    assert_eq!(first.asset.failure().unwrap().kind, FailureKind::Timeout);
    assert!(matches!(first.value, LegOutcome::Confirmed(_)));
    assert_eq!(first.phase, Phase::PartiallyReleased);
    assert_eq!(first.confirmed_legs(), vec!["value"]);
    assert_eq!(ledger.owner(&asset()), Some(CUSTODIAN));

    let second = custodian.release(&mut record).await.unwrap();
    assert!(matches!(second.asset, LegOutcome::Confirmed(_)));
    assert_eq!(second.value, LegOutcome::Skipped(SkipReason::AlreadySettled));
    assert_eq!(second.phase, Phase::Released);
    assert_eq!(ledger.owner(&asset()), Some(BUYER));
    assert_eq!(ledger.balance_of(&SELLER), PRICE);
}

#[tokio::test]
async fn asset_already_moved_is_skipped() {
    let ledger = market();
    let mut record = deposited(&ledger).await;

    // an earlier crashed run already delivered the asset
    ledger.mint(asset(), BUYER);

    let settlement = engine(&ledger, CUSTODIAN)
        .release(&mut record)
        .await
        .unwrap();
    assert_eq!(
        settlement.asset,
        LegOutcome::Skipped(SkipReason::AlreadyAtDestination)
    );
    assert!(matches!(settlement.value, LegOutcome::Confirmed(_)));
    assert!(settlement.is_complete());
    assert_eq!(ledger.calls().asset_transfers, 1); // the deposit only
}

#[tokio::test]
async fn missing_asset_counts_as_done() {
    let ledger = market();
    let mut record = deposited(&ledger).await;
    ledger.burn(&asset());

    let settlement = engine(&ledger, CUSTODIAN)
        .refund(&mut record)
        .await
        .unwrap();
    assert_eq!(settlement.asset, LegOutcome::Skipped(SkipReason::AssetNotFound));
    assert_eq!(settlement.phase, Phase::Refunded);
    assert_eq!(ledger.balance_of(&BUYER), Lamports(PRICE.0 + FEE_BUFFER.0));
}

#[tokio::test]
async fn release_refuses_asset_held_by_a_third_party() {
    let ledger = market();
    let mut record = deposited(&ledger).await;
    ledger.mint(asset(), STRANGER);

    let before = ledger.calls();
    let err = engine(&ledger, CUSTODIAN)
        .release(&mut record)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        EscrowError::NotOwner {
            party: CUSTODIAN,
            owner: STRANGER
        }
    );
    let after = ledger.calls();
    assert_eq!(after.asset_transfers, before.asset_transfers);
    assert_eq!(after.value_transfers, before.value_transfers);
    assert_eq!(ledger.balance_of(&SELLER), Lamports::ZERO);
    assert_eq!(ledger.balance_of(&CUSTODIAN), PRICE);
    assert_eq!(record.phase(), Phase::FullyDeposited);
    assert_eq!(record.settling(), None);
    assert_eq!(record.settlement().value, LegProgress::Outstanding);
}

#[tokio::test]
async fn seller_who_kept_the_asset_is_not_paid() {
    // buyer paid, seller never deposited
    let ledger = market();
    ledger.fund(CUSTODIAN, PRICE);
    let mut record = deal().with_seller(SELLER).unwrap().with_buyer(BUYER).unwrap();
    let custodian = engine(&ledger, CUSTODIAN);
    assert_eq!(
        custodian.reconcile(&mut record).await.unwrap(),
        Phase::ValueDeposited
    );

    let err = custodian.release(&mut record).await.unwrap_err();
    assert_eq!(
        err,
        EscrowError::NotOwner {
            party: CUSTODIAN,
            owner: SELLER
        }
    );
    assert_eq!(ledger.calls().value_transfers, 0);
    assert_eq!(ledger.balance_of(&SELLER), Lamports::ZERO);
    assert_eq!(ledger.owner(&asset()), Some(SELLER));
    assert_eq!(record.phase(), Phase::ValueDeposited);

    // the asset is still the seller's, so refunding it skips that leg
    let refund = custodian.refund(&mut record).await.unwrap();
    assert_eq!(
        refund.asset,
        LegOutcome::Skipped(SkipReason::AlreadyAtDestination)
    );
    assert!(matches!(refund.value, LegOutcome::Confirmed(_)));
    assert_eq!(refund.phase, Phase::Refunded);
    assert_eq!(ledger.balance_of(&BUYER), Lamports(PRICE.0 * 2 + FEE_BUFFER.0));
}

#[tokio::test]
async fn release_retry_from_saved_record_pays_once() {
    let ledger = market();
    ledger.mint(asset(), CUSTODIAN);
    // over-funded: the custody balance guard would allow a second payment
    ledger.fund(CUSTODIAN, Lamports(PRICE.0 * 2));
    let custodian = engine(&ledger, CUSTODIAN);
    let path = std::env::temp_dir().join(format!("custodian-retry-{}.json", std::process::id()));

    // first run: nothing cached yet
    let mut record = deal().with_seller(SELLER).unwrap().with_buyer(BUYER).unwrap();
    custodian.reconcile(&mut record).await.unwrap();
    assert_eq!(record.phase(), Phase::FullyDeposited);
    ledger.fail_next_asset_transfer(Fault::TimeoutDropped);
    let first = custodian.release(&mut record).await.unwrap();
    assert!(matches!(first.value, LegOutcome::Confirmed(_)));
    assert_eq!(first.phase, Phase::PartiallyReleased);
    save_escrow_data(&path, &record).unwrap();

    // second run: picks up the saved record
    let mut record: EscrowInstance = load_escrow_data(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    custodian.reconcile(&mut record).await.unwrap();
    let second = custodian.release(&mut record).await.unwrap();
    assert!(matches!(second.asset, LegOutcome::Confirmed(_)));
    assert_eq!(second.value, LegOutcome::Skipped(SkipReason::AlreadySettled));
    assert_eq!(second.phase, Phase::Released);

    assert_eq!(ledger.calls().value_transfers, 1);
    assert_eq!(ledger.balance_of(&SELLER), PRICE);
    assert_eq!(ledger.owner(&asset()), Some(BUYER));
}

#[tokio::test]
async fn refund_without_value_makes_no_value_call() {
    let ledger = market();
    let mut record = EscrowInstance::new("asset-only", CUSTODIAN, Some(asset()), Lamports::ZERO)
        .unwrap();
    engine(&ledger, SELLER)
        .deposit_asset(&mut record)
        .await
        .unwrap();

    let before = ledger.calls();
    let settlement = engine(&ledger, CUSTODIAN)
        .refund(&mut record)
        .await
        .unwrap();
    let after = ledger.calls();

    assert_eq!(settlement.value, LegOutcome::Skipped(SkipReason::NoValue));
    assert_eq!(settlement.phase, Phase::Refunded);
    assert_eq!(after.value_transfers, before.value_transfers);
    assert_eq!(after.balance_queries, before.balance_queries);
    assert_eq!(ledger.owner(&asset()), Some(SELLER));
}

#[tokio::test]
async fn missing_counterparty_fails_before_any_network_call() {
    let ledger = market();
    ledger.mint(asset(), CUSTODIAN);
    ledger.fund(CUSTODIAN, PRICE);

    // seller known, buyer never bound
    let mut record = deal().with_seller(SELLER).unwrap();
    let custodian = engine(&ledger, CUSTODIAN);
    custodian.reconcile(&mut record).await.unwrap();
    assert_eq!(record.phase(), Phase::FullyDeposited);

    let before = ledger.calls();
    for result in [
        custodian.release(&mut record).await,
        custodian.refund(&mut record).await,
    ] {
        assert!(matches!(result, Err(EscrowError::InvalidInput(_))));
    }
    assert_eq!(ledger.calls(), before);
    assert_eq!(record.phase(), Phase::FullyDeposited);
}

#[tokio::test]
async fn only_the_custodian_key_can_settle() {
    let ledger = market();
    let mut record = deposited(&ledger).await;

    let before = ledger.calls();
    let err = engine(&ledger, SELLER).release(&mut record).await.unwrap_err();
    assert_eq!(
        err,
        EscrowError::NotOwner {
            party: SELLER,
            owner: CUSTODIAN
        }
    );
    assert_eq!(ledger.calls(), before);
}

#[tokio::test]
async fn partial_release_blocks_refund() {
    let ledger = market();
    let mut record = deposited(&ledger).await;
    let custodian = engine(&ledger, CUSTODIAN);
    ledger.fail_next_value_transfer(Fault::Fail(LedgerError::Network("rpc down".into())));

    let first = custodian.release(&mut record).await.unwrap();
    assert_eq!(first.phase, Phase::PartiallyReleased);
    assert_eq!(first.value.failure().unwrap().kind, FailureKind::Network);

    assert!(matches!(
        custodian.refund(&mut record).await,
        Err(EscrowError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn failed_settlement_without_progress_keeps_phase() {
    let ledger = market();
    let mut record = deposited(&ledger).await;
    let custodian = engine(&ledger, CUSTODIAN);
    ledger.fail_next_asset_transfer(Fault::Fail(LedgerError::Network("rpc down".into())));
    ledger.fail_next_value_transfer(Fault::TimeoutPending);

    let first = custodian.release(&mut record).await.unwrap();
    assert!(first.asset.failure().is_some());
    assert!(first.value.failure().is_some());
    assert_eq!(first.phase, Phase::FullyDeposited);

    // the pending release payment locks the direction
    assert!(matches!(
        custodian.refund(&mut record).await,
        Err(EscrowError::InvalidTransition { .. })
    ));

    ledger.settle_pending();
    let second = custodian.release(&mut record).await.unwrap();
    assert!(matches!(second.asset, LegOutcome::Confirmed(_)));
    assert!(matches!(
        second.value,
        LegOutcome::Skipped(SkipReason::AlreadyConfirmed(_))
    ));
    assert_eq!(second.phase, Phase::Released);
}

#[tokio::test]
async fn reconcile_rebuilds_phase_from_live_state() {
    let ledger = market();
    let custodian = engine(&ledger, CUSTODIAN);

    let mut record = deal();
    assert_eq!(custodian.reconcile(&mut record).await.unwrap(), Phase::Empty);

    ledger.mint(asset(), CUSTODIAN);
    assert_eq!(
        custodian.reconcile(&mut record).await.unwrap(),
        Phase::AssetDeposited
    );

    // past Empty, reconcile leaves the record alone
    ledger.fund(CUSTODIAN, PRICE);
    assert_eq!(
        custodian.reconcile(&mut record).await.unwrap(),
        Phase::AssetDeposited
    );

    let mut fresh = deal();
    assert_eq!(
        custodian.reconcile(&mut fresh).await.unwrap(),
        Phase::FullyDeposited
    );
}

#[tokio::test]
async fn funds_only_deal() {
    let ledger = market();
    let mut record = EscrowInstance::new("funds-only", CUSTODIAN, None, PRICE)
        .unwrap()
        .with_seller(SELLER)
        .unwrap();

    assert!(matches!(
        engine(&ledger, SELLER).deposit_asset(&mut record).await,
        Err(EscrowError::InvalidInput(_))
    ));
    engine(&ledger, BUYER)
        .deposit_value(&mut record)
        .await
        .unwrap();
    assert_eq!(record.phase(), Phase::ValueDeposited);

    let settlement = engine(&ledger, CUSTODIAN)
        .release(&mut record)
        .await
        .unwrap();
    assert_eq!(settlement.asset, LegOutcome::Skipped(SkipReason::NoAsset));
    assert_eq!(settlement.phase, Phase::Released);
    assert_eq!(ledger.balance_of(&SELLER), PRICE);
}

#[tokio::test]
async fn abandon_is_terminal() {
    let ledger = market();
    let mut record = deposited(&ledger).await;
    let custodian = engine(&ledger, CUSTODIAN);

    assert_eq!(
        custodian.abandon(&mut record, "buyer unreachable").unwrap(),
        Phase::Failed
    );
    assert_eq!(record.failure(), Some("buyer unreachable"));
    assert!(custodian.abandon(&mut record, "again").is_err());
    assert!(matches!(
        custodian.release(&mut record).await,
        Err(EscrowError::InvalidTransition { .. })
    ));
}
