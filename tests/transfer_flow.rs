use std::sync::Arc;
use std::time::Duration;

use funds_transfer::transfer::{
    ApiStatus, CreateTransferRequest, DirectTransfer, ExecutionMode, MemoryStore, RetryPolicy,
    SagaState, StepLogExecutor, TransferId, TransferSaga, TransferService, TransferStatus,
};
use funds_transfer::CompensationPolicy;

/// Service over a fresh in-memory store seeded with two IDR accounts
fn service(mode: ExecutionMode, sender: i64, recipient: i64) -> (TransferService, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    store.open_account("acc-sender", "owner-1", "IDR", sender).unwrap();
    store.open_account("acc-recipient", "owner-2", "IDR", recipient).unwrap();

    let policy = RetryPolicy {
        initial_backoff: Duration::from_millis(1),
        ..RetryPolicy::default()
    };
    let executor = Arc::new(StepLogExecutor::new(store.clone(), policy));
    let saga = Arc::new(TransferSaga::new(
        store.clone(),
        executor,
        None,
        CompensationPolicy::None,
    ));
    let direct = DirectTransfer::new(store.clone(), None);
    (TransferService::new(mode, direct, saga), store)
}

fn request(recipient: &str, amount: i64) -> CreateTransferRequest {
    CreateTransferRequest {
        sender_id: "acc-sender".to_string(),
        recipient_id: recipient.to_string(),
        amount,
        currency: "IDR".to_string(),
        memo: None,
    }
}

#[tokio::test]
async fn direct_transfer_moves_funds() {
    let (service, store) = service(ExecutionMode::Direct, 1_000_000, 500_000);

    let resp = service
        .create_transfer(request("acc-recipient", 200_000))
        .await
        .unwrap();

    assert_eq!(resp.status, TransferStatus::Completed);
    let record = resp.transaction.unwrap();
    assert_eq!(record.amount, 200_000);
    assert_eq!(record.currency.as_str(), "IDR");
    assert_eq!(store.balance("acc-sender"), Some(800_000));
    assert_eq!(store.balance("acc-recipient"), Some(700_000));
}

#[tokio::test]
async fn insufficient_funds_changes_nothing() {
    let (service, store) = service(ExecutionMode::Direct, 100, 0);

    let err = service
        .create_transfer(request("acc-recipient", 200))
        .await
        .unwrap_err();

    assert_eq!(err.status, ApiStatus::InvalidArgument);
    assert_eq!(err.code, "INSUFFICIENT_FUNDS");
    assert_eq!(store.balance("acc-sender"), Some(100));
    assert_eq!(store.balance("acc-recipient"), Some(0));
}

#[tokio::test]
async fn unknown_recipient_is_not_found() {
    let (service, store) = service(ExecutionMode::Direct, 1_000, 0);

    let err = service
        .create_transfer(request("ghost", 10))
        .await
        .unwrap_err();

    assert_eq!(err.status, ApiStatus::NotFound);
    assert_eq!(store.balance("acc-sender"), Some(1_000));
}

#[tokio::test]
async fn saga_transfer_reaches_completed() {
    let (service, store) = service(ExecutionMode::Saga, 1_000_000, 500_000);

    let resp = service
        .create_transfer(request("acc-recipient", 200_000))
        .await
        .unwrap();
    assert_eq!(resp.status, TransferStatus::Pending);

    // Drive it here as well; concurrent drivers are safe
    let id: TransferId = resp.transaction_id.parse().unwrap();
    let state = service.saga().execute(id).await.unwrap();
    assert_eq!(state, SagaState::Completed);

    let status = service
        .get_transaction_status(&resp.transaction_id)
        .await
        .unwrap();
    assert_eq!(status.status, TransferStatus::Completed);
    assert_eq!(store.balance("acc-sender"), Some(800_000));
    assert_eq!(store.balance("acc-recipient"), Some(700_000));
}

#[tokio::test]
async fn status_of_unknown_transaction_is_not_found() {
    let (service, _store) = service(ExecutionMode::Saga, 0, 0);

    let err = service
        .get_transaction_status(&TransferId::new().to_string())
        .await
        .unwrap_err();
    assert_eq!(err.status, ApiStatus::NotFound);
}
