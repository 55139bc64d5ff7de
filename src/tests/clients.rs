use std::sync::Arc;

use crate::client::Client;
use crate::clients::Clients;
use crate::config::{APP_BUNDLE_ID, TaskQueueConfig};
use crate::error::ClientError;
use crate::property::NullNotifier;
use crate::task_queue::TaskQueue;
use crate::tests::capture_logs;

#[test]
fn duplicate_client_is_not_logged_as_added() {
    let queue = Arc::new(TaskQueue::new(TaskQueueConfig::default(), Arc::new(NullNotifier)).unwrap());
    let clients = Clients::new(2, APP_BUNDLE_ID, Arc::clone(&queue));

    let mut results = Vec::new();
    let logs = capture_logs(|| {
        results.push(clients.add_client(Client::new(1, 101, None, true)));
        results.push(clients.add_client(Client::new(1, 102, None, true)));
    });

    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(ClientError::DuplicateClient(1))));
    assert_eq!(logs.matches("client added").count(), 1);
    assert_eq!(clients.io_counts().total, 0);
}
