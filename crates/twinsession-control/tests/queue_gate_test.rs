//! Ordering guarantees of the dispatch handle against a running control task

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use twinsession_control::{
    ControlMessage, DispatchHandle, Dispatcher, HandlerError, SessionContext,
};
use twinsession_proto::{ActionEnvelope, DispatchMode, Response, ReturnStatus};

fn spawn_control_task(
    mut dispatcher: Dispatcher,
    mut receiver: mpsc::Receiver<ControlMessage>,
) -> tokio::task::JoinHandle<Dispatcher> {
    tokio::spawn(async move {
        while let Some(message) = receiver.recv().await {
            if let ControlMessage::Dispatch {
                envelope,
                mode,
                reply,
            } = message
            {
                let _ = reply.send(dispatcher.dispatch(&envelope, mode));
            }
        }
        dispatcher
    })
}

#[tokio::test]
async fn test_queue_mode_applies_in_gate_order() {
    let applied = Arc::new(Mutex::new(Vec::new()));
    let mut dispatcher = Dispatcher::new(SessionContext::default());
    let record = applied.clone();
    dispatcher.bind("Record", move |envelope| {
        let seq = envelope.get_u64("seq")?;
        record.lock().unwrap().push(seq);
        Ok(String::new())
    });

    let (handle, receiver) = DispatchHandle::channel(64);
    let control = spawn_control_task(dispatcher, receiver);

    let mut senders = Vec::new();
    for seq in 0..32u64 {
        let handle = handle.clone();
        senders.push(tokio::spawn(async move {
            handle
                .submit(
                    ActionEnvelope::new("Record").with_param("seq", seq),
                    DispatchMode::Queue,
                )
                .await
                .unwrap()
        }));
    }
    for sender in senders {
        let reply = sender.await.unwrap();
        assert!(!Response::parse(&reply).is_error_flagged());
    }

    assert_eq!(*applied.lock().unwrap(), (0..32).collect::<Vec<u64>>());

    drop(handle);
    control.await.unwrap();
}

#[tokio::test]
async fn test_execute_bypasses_held_queue_gate() {
    let (handle, mut receiver) = DispatchHandle::channel(16);
    let log = Arc::new(Mutex::new(Vec::<String>::new()));
    let (seen_tx, seen_rx) = oneshot::channel::<()>();
    let (release_tx, mut release_rx) = oneshot::channel::<()>();

    let control_log = log.clone();
    tokio::spawn(async move {
        let mut held: Option<oneshot::Sender<String>> = None;
        let mut seen_tx = Some(seen_tx);
        loop {
            tokio::select! {
                message = receiver.recv() => {
                    let Some(ControlMessage::Dispatch { envelope, reply, .. }) = message else {
                        break;
                    };
                    control_log.lock().unwrap().push(envelope.action.clone());
                    if envelope.action == "Hold" {
                        held = Some(reply);
                        if let Some(seen) = seen_tx.take() {
                            let _ = seen.send(());
                        }
                    } else {
                        let _ = reply.send(envelope.action);
                    }
                }
                _ = &mut release_rx, if held.is_some() => {
                    if let Some(reply) = held.take() {
                        let _ = reply.send("Hold".to_string());
                    }
                }
            }
        }
    });

    let first = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle
                .submit(ActionEnvelope::new("Hold"), DispatchMode::Queue)
                .await
        })
    };
    seen_rx.await.unwrap();

    let second = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle
                .submit(ActionEnvelope::new("Second"), DispatchMode::Queue)
                .await
        })
    };

    let ping = tokio::time::timeout(
        Duration::from_secs(5),
        handle.submit(ActionEnvelope::new("Ping"), DispatchMode::Execute),
    )
    .await
    .expect("execute must not wait for the queue gate")
    .unwrap();
    assert_eq!(ping, "Ping");

    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!log.lock().unwrap().contains(&"Second".to_string()));

    release_tx.send(()).unwrap();
    assert_eq!(first.await.unwrap().unwrap(), "Hold");
    assert_eq!(second.await.unwrap().unwrap(), "Second");
    assert_eq!(*log.lock().unwrap(), vec!["Hold", "Ping", "Second"]);
}

#[tokio::test]
async fn test_failing_handlers_do_not_stop_the_control_task() {
    let mut dispatcher = Dispatcher::new(SessionContext::default());
    dispatcher.bind("Fail", |_| Err(HandlerError::from("nope")));
    dispatcher.bind("Panic", |_| panic!("boom"));

    let (handle, receiver) = DispatchHandle::channel(8);
    let control = spawn_control_task(dispatcher, receiver);

    for action in ["Fail", "Panic", "Unbound"] {
        let reply = handle
            .submit(ActionEnvelope::new(action), DispatchMode::Queue)
            .await
            .unwrap();
        match Response::parse(&reply) {
            Response::Tagged(message) => assert_eq!(message.status, ReturnStatus::Failed),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    let reply = handle
        .submit(ActionEnvelope::new("Ping"), DispatchMode::Execute)
        .await
        .unwrap();
    assert_eq!(reply, "Ping");

    drop(handle);
    control.await.unwrap();
}

#[tokio::test]
async fn test_batch_runs_in_one_gate_turn() {
    let applied = Arc::new(Mutex::new(Vec::new()));
    let mut dispatcher = Dispatcher::new(SessionContext::default());
    let record = applied.clone();
    dispatcher.bind("Record", move |envelope| {
        let seq = envelope.get_u64("seq")?;
        record.lock().unwrap().push(seq);
        Ok(seq.to_string())
    });

    let (handle, receiver) = DispatchHandle::channel(16);
    let control = spawn_control_task(dispatcher, receiver);

    let batch = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle
                .submit_batch(
                    (0..5)
                        .map(|seq| ActionEnvelope::new("Record").with_param("seq", seq))
                        .collect(),
                )
                .await
                .unwrap()
        })
    };
    let single = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle
                .submit(
                    ActionEnvelope::new("Record").with_param("seq", 99),
                    DispatchMode::Queue,
                )
                .await
                .unwrap()
        })
    };

    let replies: Vec<String> = serde_json::from_str(&batch.await.unwrap()).unwrap();
    assert_eq!(replies, vec!["0", "1", "2", "3", "4"]);
    single.await.unwrap();

    assert_eq!(*applied.lock().unwrap(), vec![0, 1, 2, 3, 4, 99]);

    drop(handle);
    control.await.unwrap();
}
