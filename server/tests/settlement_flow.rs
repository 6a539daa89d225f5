mod common;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use creatorpay_server::error::SettlementError;
use creatorpay_server::ledger::LedgerStore;
use creatorpay_server::models::{
    EarningStatus, EscrowStatus, OnboardingStatus, PayoutStatus,
};
use creatorpay_server::services::ReconcileOutcome;

use common::{event, event_at, Harness};

#[tokio::test]
async fn settled_escrow_splits_after_platform_fee() {
    let harness = Harness::new();
    let escrow_id = harness.fund_escrow(10_000).await;

    let earnings = harness.ledger.earnings_for_escrow(escrow_id).await.unwrap();
    assert_eq!(earnings.len(), 2);
    let share = |creator: Uuid| {
        earnings
            .iter()
            .find(|earning| earning.creator_id == creator)
            .map(|earning| earning.amount)
            .unwrap()
    };
    assert_eq!(share(harness.creators[0]), 6_000);
    assert_eq!(share(harness.creators[1]), 3_000);
    assert_eq!(earnings.iter().map(|e| e.amount).sum::<i64>(), 9_000);
    assert!(earnings.iter().all(|e| e.status == EarningStatus::Pending));

    // Creators that never onboarded still get an account to hold their earnings.
    for creator in &harness.creators {
        let account = harness
            .ledger
            .find_account_by_creator(*creator)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.onboarding_status, OnboardingStatus::NotStarted);
    }
}

#[tokio::test]
async fn duplicate_success_event_creates_one_earning_set() {
    let harness = Harness::new();
    let (escrow_id, intent_id) = harness.open_escrow(10_000).await;
    let payload = event("payment_intent.succeeded", json!({ "id": intent_id }));

    assert_eq!(harness.deliver(&payload).await.unwrap(), ReconcileOutcome::Applied);
    let first = harness.ledger.earnings_for_escrow(escrow_id).await.unwrap();
    for _ in 0..3 {
        assert_eq!(
            harness.deliver(&payload).await.unwrap(),
            ReconcileOutcome::Duplicate
        );
    }

    let after = harness.ledger.earnings_for_escrow(escrow_id).await.unwrap();
    assert_eq!(harness.ledger.all_earnings().await.len(), 2);
    let mut first_ids: Vec<Uuid> = first.iter().map(|e| e.id).collect();
    let mut after_ids: Vec<Uuid> = after.iter().map(|e| e.id).collect();
    first_ids.sort();
    after_ids.sort();
    assert_eq!(first_ids, after_ids);
}

#[tokio::test]
async fn concurrent_materialization_writes_one_set() {
    let harness = Harness::new();
    let (escrow_id, _) = harness.open_escrow(10_000).await;
    harness
        .ledger
        .transition_escrow(
            escrow_id,
            &[EscrowStatus::Created],
            EscrowStatus::Succeeded,
            None,
        )
        .await
        .unwrap()
        .unwrap();

    let earnings = &harness.state.earnings;
    let (a, b, c, d) = tokio::join!(
        earnings.materialize_earnings(escrow_id),
        earnings.materialize_earnings(escrow_id),
        earnings.materialize_earnings(escrow_id),
        earnings.materialize_earnings(escrow_id),
    );

    let sets = [a.unwrap(), b.unwrap(), c.unwrap(), d.unwrap()];
    let all = harness.ledger.all_earnings().await;
    assert_eq!(all.len(), 2);
    assert!(all.iter().map(|e| e.amount).sum::<i64>() <= 10_000);
    for set in sets {
        assert_eq!(set.len(), 2);
        assert!(set.iter().all(|e| all.iter().any(|stored| stored.id == e.id)));
    }
}

#[tokio::test]
async fn materializing_unsettled_escrow_is_rejected() {
    let harness = Harness::new();
    let (escrow_id, _) = harness.open_escrow(10_000).await;

    let err = harness
        .state
        .earnings
        .materialize_earnings(escrow_id)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::EscrowNotSettled));

    let err = harness
        .state
        .earnings
        .materialize_earnings(Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::EscrowNotFound));
}

#[tokio::test]
async fn failed_payment_is_terminal() {
    let harness = Harness::new();
    let (escrow_id, intent_id) = harness.open_escrow(10_000).await;

    let failed = event(
        "payment_intent.payment_failed",
        json!({ "id": intent_id, "last_payment_error": { "message": "card_declined" } }),
    );
    assert_eq!(harness.deliver(&failed).await.unwrap(), ReconcileOutcome::Applied);
    assert_eq!(harness.deliver(&failed).await.unwrap(), ReconcileOutcome::Duplicate);

    let late_success = event("payment_intent.succeeded", json!({ "id": intent_id }));
    assert_eq!(
        harness.deliver(&late_success).await.unwrap(),
        ReconcileOutcome::Ignored
    );

    let escrow = harness.state.intake.get_escrow(escrow_id).await.unwrap();
    assert_eq!(escrow.status, EscrowStatus::Failed);
    assert_eq!(escrow.failure_reason.as_deref(), Some("card_declined"));
    assert!(harness.ledger.all_earnings().await.is_empty());
}

#[tokio::test]
async fn succeeded_escrow_never_moves_again() {
    let harness = Harness::new();
    let (escrow_id, intent_id) = harness.open_escrow(10_000).await;
    harness
        .deliver(&event("payment_intent.succeeded", json!({ "id": intent_id })))
        .await
        .unwrap();

    for late in [
        event("payment_intent.payment_failed", json!({ "id": intent_id })),
        event("payment_intent.canceled", json!({ "id": intent_id })),
        event("payment_intent.requires_action", json!({ "id": intent_id })),
    ] {
        assert_eq!(harness.deliver(&late).await.unwrap(), ReconcileOutcome::Ignored);
    }

    let escrow = harness.state.intake.get_escrow(escrow_id).await.unwrap();
    assert_eq!(escrow.status, EscrowStatus::Succeeded);
}

#[tokio::test]
async fn requires_action_then_success() {
    let harness = Harness::new();
    let (escrow_id, intent_id) = harness.open_escrow(10_000).await;

    harness
        .deliver(&event("payment_intent.requires_action", json!({ "id": intent_id })))
        .await
        .unwrap();
    assert_eq!(
        harness.state.intake.get_escrow(escrow_id).await.unwrap().status,
        EscrowStatus::RequiresAction
    );

    assert_eq!(
        harness
            .deliver(&event("payment_intent.succeeded", json!({ "id": intent_id })))
            .await
            .unwrap(),
        ReconcileOutcome::Applied
    );
    assert_eq!(harness.ledger.earnings_for_escrow(escrow_id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn invalid_signature_changes_nothing() {
    let harness = Harness::new();
    let (escrow_id, intent_id) = harness.open_escrow(10_000).await;
    let payload = event("payment_intent.succeeded", json!({ "id": intent_id }));

    let forged = format!("t={},v1={}", Utc::now().timestamp(), "00".repeat(32));
    let err = harness
        .state
        .reconciler
        .handle_webhook_event(&payload, &forged)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::InvalidSignature));

    let err = harness
        .state
        .reconciler
        .handle_webhook_event(&payload, "")
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::InvalidSignature));

    let escrow = harness.state.intake.get_escrow(escrow_id).await.unwrap();
    assert_eq!(escrow.status, EscrowStatus::Created);
    assert!(harness.ledger.all_earnings().await.is_empty());
}

#[tokio::test]
async fn events_for_unknown_entities_are_unmatched() {
    let harness = Harness::new();

    assert_eq!(
        harness
            .deliver(&event("payment_intent.succeeded", json!({ "id": "pi_unknown" })))
            .await
            .unwrap(),
        ReconcileOutcome::Unmatched
    );
    assert_eq!(
        harness
            .deliver(&event("account.updated", json!({ "id": "acct_unknown" })))
            .await
            .unwrap(),
        ReconcileOutcome::Unmatched
    );
    assert_eq!(
        harness
            .deliver(&event("payout.paid", json!({ "id": "po_unknown" })))
            .await
            .unwrap(),
        ReconcileOutcome::Unmatched
    );
    assert_eq!(
        harness
            .deliver(&event("charge.refunded", json!({ "id": "ch_1" })))
            .await
            .unwrap(),
        ReconcileOutcome::Ignored
    );
}

#[tokio::test]
async fn onboarding_retries_after_processor_failure() {
    let harness = Harness::new();
    let creator = harness.creators[0];

    harness.gateway.set_fail_accounts(true);
    let err = harness
        .state
        .onboarding
        .start_onboarding(creator)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::ProcessorUnavailable(_)));
    let status = harness.state.onboarding.get_status(creator).await.unwrap();
    assert_eq!(status.status, OnboardingStatus::NotStarted);

    harness.gateway.set_fail_accounts(false);
    let account = harness.state.onboarding.start_onboarding(creator).await.unwrap();
    assert_eq!(account.onboarding_status, OnboardingStatus::Pending);

    let again = harness.state.onboarding.start_onboarding(creator).await.unwrap();
    assert_eq!(again.id, account.id);
    assert_eq!(again.external_account_id, account.external_account_id);
    assert_eq!(harness.gateway.account_calls(), 2);
}

#[tokio::test]
async fn account_links_require_an_unfinished_account() {
    let harness = Harness::new();
    let creator = harness.creators[0];

    let err = harness
        .state
        .onboarding
        .create_account_link(creator)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::AccountNotFound));

    harness.state.onboarding.start_onboarding(creator).await.unwrap();
    let url = harness
        .state
        .onboarding
        .create_account_link(creator)
        .await
        .unwrap();
    assert!(url.starts_with("https://"));

    harness.activate(creator).await;
    let err = harness
        .state
        .onboarding
        .create_account_link(creator)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::AccountAlreadyActive));
}

#[tokio::test]
async fn stale_account_update_is_discarded() {
    let harness = Harness::new();
    let creator = harness.creators[0];
    let account = harness.state.onboarding.start_onboarding(creator).await.unwrap();
    let external = account.external_account_id.unwrap();
    let now = Utc::now().timestamp();

    let newer = event_at(
        "account.updated",
        json!({ "id": external, "charges_enabled": true, "payouts_enabled": true }),
        now,
    );
    let older = event_at(
        "account.updated",
        json!({
            "id": external,
            "charges_enabled": false,
            "payouts_enabled": false,
            "requirements": { "past_due": ["individual.id_number"] }
        }),
        now - 60,
    );

    assert_eq!(harness.deliver(&newer).await.unwrap(), ReconcileOutcome::Applied);
    assert_eq!(harness.deliver(&older).await.unwrap(), ReconcileOutcome::Ignored);

    let status = harness.state.onboarding.get_status(creator).await.unwrap();
    assert_eq!(status.status, OnboardingStatus::Active);
    assert!(status.payouts_enabled);
}

#[tokio::test]
async fn restricted_account_is_not_paid() {
    let harness = Harness::with_weights(0, &[1]);
    let creator = harness.creators[0];
    let external = harness.activate(creator).await;
    harness.fund_escrow(5_000).await;

    harness
        .deliver(&event(
            "account.updated",
            json!({
                "id": external,
                "charges_enabled": true,
                "payouts_enabled": false,
                "requirements": { "disabled_reason": "requirements.past_due" }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(
        harness.state.onboarding.get_status(creator).await.unwrap().status,
        OnboardingStatus::Restricted
    );

    let report = harness.state.dispatcher.run_payout_cycle().await.unwrap();
    assert_eq!(report.requests_submitted, 0);
    assert!(harness.gateway.payouts().is_empty());
}

#[tokio::test]
async fn earnings_below_threshold_are_not_paid_out() {
    let harness = Harness::with_weights(0, &[1]);
    harness.activate(harness.creators[0]).await;
    harness.fund_escrow(500).await;

    let report = harness.state.dispatcher.run_payout_cycle().await.unwrap();

    assert_eq!(report.promoted, 1);
    assert_eq!(report.groups_below_threshold, 1);
    assert!(harness.ledger.all_payout_requests().await.is_empty());
    assert_eq!(
        harness.ledger.all_earnings().await[0].status,
        EarningStatus::Payable
    );
}

#[tokio::test]
async fn paid_payout_settles_covered_earnings() {
    let harness = Harness::with_weights(0, &[1]);
    harness.activate(harness.creators[0]).await;
    harness.fund_escrow(800).await;
    harness.fund_escrow(700).await;

    let report = harness.state.dispatcher.run_payout_cycle().await.unwrap();
    assert_eq!(report.requests_submitted, 1);
    assert_eq!(report.earnings_claimed, 2);

    let payout = harness.gateway.payouts().pop().unwrap();
    assert_eq!(payout.amount, 1_500);
    let in_transit = event(
        "payout.updated",
        json!({ "id": payout.external_payout_id, "status": "in_transit" }),
    );
    assert_eq!(harness.deliver(&in_transit).await.unwrap(), ReconcileOutcome::Applied);

    let paid = event("payout.paid", json!({ "id": payout.external_payout_id }));
    assert_eq!(harness.deliver(&paid).await.unwrap(), ReconcileOutcome::Applied);
    assert_eq!(harness.deliver(&paid).await.unwrap(), ReconcileOutcome::Duplicate);

    let request = harness
        .ledger
        .get_payout_request(payout.payout_request_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.status, PayoutStatus::Paid);
    let earnings = harness.ledger.all_earnings().await;
    assert!(earnings.iter().all(|e| e.status == EarningStatus::Paid));
    let covered = harness.ledger.earnings_for_payout(request.id).await.unwrap();
    assert_eq!(covered.len(), earnings.len());
    assert_eq!(covered.iter().map(|e| e.amount).sum::<i64>(), request.amount);

    // Late notices cannot unwind a paid payout.
    let failed = event("payout.failed", json!({ "id": payout.external_payout_id }));
    assert_eq!(harness.deliver(&failed).await.unwrap(), ReconcileOutcome::Ignored);
    assert_eq!(harness.deliver(&in_transit).await.unwrap(), ReconcileOutcome::Ignored);
    let request = harness.ledger.get_payout_request(request.id).await.unwrap().unwrap();
    assert_eq!(request.status, PayoutStatus::Paid);
}

#[tokio::test]
async fn failed_payout_releases_earnings_for_the_next_cycle() {
    let harness = Harness::with_weights(0, &[1]);
    harness.activate(harness.creators[0]).await;
    harness.fund_escrow(1_500).await;

    harness.state.dispatcher.run_payout_cycle().await.unwrap();
    let first = harness.gateway.payouts().pop().unwrap();
    assert_eq!(first.amount, 1_500);

    let failed = event(
        "payout.failed",
        json!({ "id": first.external_payout_id, "failure_code": "account_closed" }),
    );
    assert_eq!(harness.deliver(&failed).await.unwrap(), ReconcileOutcome::Applied);
    assert_eq!(harness.deliver(&failed).await.unwrap(), ReconcileOutcome::Duplicate);

    let earning = harness.ledger.all_earnings().await.pop().unwrap();
    assert_eq!(earning.status, EarningStatus::Payable);
    assert_eq!(earning.payout_request_id, None);
    let request = harness
        .ledger
        .get_payout_request(first.payout_request_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.status, PayoutStatus::Failed);
    assert_eq!(request.failure_reason.as_deref(), Some("account_closed"));
    let covered = harness.ledger.earnings_for_payout(request.id).await.unwrap();
    assert_eq!(covered.len(), 1);
    assert_eq!(covered[0].id, earning.id);

    let report = harness.state.dispatcher.run_payout_cycle().await.unwrap();
    assert_eq!(report.requests_submitted, 1);
    let requests = harness.ledger.all_payout_requests().await;
    assert_eq!(requests.len(), 2);
    assert_ne!(requests[1].id, first.payout_request_id);
    assert_eq!(requests[1].amount, 1_500);
    assert_eq!(requests[1].status, PayoutStatus::Requested);

    // The failed request still records what it covered after the re-claim.
    let covered = harness.ledger.earnings_for_payout(request.id).await.unwrap();
    assert_eq!(covered.len(), 1);
    assert_eq!(covered[0].payout_request_id, Some(requests[1].id));
}

#[tokio::test]
async fn payout_event_matches_by_request_metadata() {
    let harness = Harness::with_weights(0, &[1]);
    let creator = harness.creators[0];
    harness.activate(creator).await;
    harness.fund_escrow(2_000).await;

    // A request whose submit response was lost before it reached the ledger.
    let account = harness
        .ledger
        .find_account_by_creator(creator)
        .await
        .unwrap()
        .unwrap();
    harness
        .ledger
        .promote_matured_earnings(Utc::now())
        .await
        .unwrap();
    let ids: Vec<Uuid> = harness
        .ledger
        .all_earnings()
        .await
        .iter()
        .map(|e| e.id)
        .collect();
    let request = harness
        .ledger
        .create_payout_request(account.id, "usd")
        .await
        .unwrap();
    harness.ledger.claim_earnings(request.id, &ids).await.unwrap();

    let paid = event(
        "payout.paid",
        json!({
            "id": "po_recovered",
            "metadata": { "payout_request_id": request.id.to_string() }
        }),
    );
    assert_eq!(harness.deliver(&paid).await.unwrap(), ReconcileOutcome::Applied);

    let request = harness
        .ledger
        .get_payout_request(request.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.status, PayoutStatus::Paid);
    assert_eq!(request.external_payout_id.as_deref(), Some("po_recovered"));
}

#[tokio::test]
async fn processor_outage_during_payout_releases_earnings() {
    let harness = Harness::with_weights(0, &[1]);
    harness.activate(harness.creators[0]).await;
    harness.fund_escrow(3_000).await;

    harness.gateway.set_fail_payouts(true);
    let report = harness.state.dispatcher.run_payout_cycle().await.unwrap();
    assert_eq!(report.requests_failed, 1);
    assert_eq!(
        harness.ledger.all_earnings().await[0].status,
        EarningStatus::Payable
    );

    harness.gateway.set_fail_payouts(false);
    let report = harness.state.dispatcher.run_payout_cycle().await.unwrap();
    assert_eq!(report.requests_submitted, 1);
    assert_eq!(harness.gateway.payouts()[0].amount, 3_000);
}

#[tokio::test]
async fn concurrent_cycles_pay_each_earning_once() {
    let harness = Harness::with_weights(0, &[1, 1]);
    for creator in harness.creators.clone() {
        harness.activate(creator).await;
    }
    harness.fund_escrow(4_000).await;
    harness.fund_escrow(6_000).await;

    let dispatcher = &harness.state.dispatcher;
    let (a, b) = tokio::join!(dispatcher.run_payout_cycle(), dispatcher.run_payout_cycle());
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.requests_submitted + b.requests_submitted, 2);

    let payouts = harness.gateway.payouts();
    assert_eq!(payouts.len(), 2);
    assert_eq!(payouts.iter().map(|p| p.amount).sum::<i64>(), 10_000);

    let earnings = harness.ledger.all_earnings().await;
    assert!(earnings.iter().all(|e| e.status == EarningStatus::InPayout));
    for earning in &earnings {
        let request = harness
            .ledger
            .get_payout_request(earning.payout_request_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.status, PayoutStatus::Requested);
        assert_eq!(request.account_id, earning.account_id);
    }
}

#[tokio::test]
async fn deactivated_creators_are_excluded_from_payouts() {
    let harness = Harness::with_weights(0, &[1]);
    let creator = harness.creators[0];
    harness.activate(creator).await;
    harness.fund_escrow(5_000).await;

    let account = harness
        .state
        .onboarding
        .deactivate_account(creator)
        .await
        .unwrap();
    assert!(!account.active);

    let report = harness.state.dispatcher.run_payout_cycle().await.unwrap();
    assert_eq!(report.requests_submitted, 0);
    assert!(harness.gateway.payouts().is_empty());
}
