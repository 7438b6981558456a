use buspoll::error::{IssueError, TransportError};
use buspoll::registry::{DeviceDescriptor, DeviceId, FunctionCode};
use buspoll::transaction::{BusTransactionManager, TerminalNotification};
use buspoll::transport::{completion_channel, BusEvent, BusRequest, BusTransport, FailureKind};
use crossbeam_channel::{unbounded, Sender};
use std::time::{Duration, Instant};

/// Forwards every request to a "wire" thread over a channel.
struct ThreadedBus {
    wire: Sender<BusRequest>,
}

impl BusTransport for ThreadedBus {
    fn submit(&mut self, request: BusRequest) -> Result<(), TransportError> {
        self.wire.send(request).map_err(|_| TransportError::Disconnected)
    }
}

fn sensor() -> DeviceDescriptor {
    DeviceDescriptor::new(1, 7, FunctionCode::ReadInputRegisters, 0x0001, 2, 1000)
}

fn wait_for_notification(
    manager: &mut BusTransactionManager<ThreadedBus>,
    started: Instant,
) -> Option<TerminalNotification> {
    while started.elapsed() < Duration::from_secs(5) {
        let now = started.elapsed().as_millis() as u64;
        if let Some(notification) = manager.poll(now) {
            return Some(notification);
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    None
}

#[test]
fn test_completion_from_another_thread() {
    let (wire_tx, wire_rx) = unbounded::<BusRequest>();
    let (completions, receiver) = completion_channel(4);
    let mut manager = BusTransactionManager::new(ThreadedBus { wire: wire_tx }, receiver, 2000);

    let worker = std::thread::spawn(move || {
        for request in wire_rx.iter() {
            std::thread::sleep(Duration::from_millis(10));
            completions.deliver(BusEvent::response(&request, &[215, 480])).unwrap();
        }
    });

    let started = Instant::now();
    let accepted = manager.issue(DeviceId(0), &sensor(), 0).unwrap();
    assert!(!manager.is_idle());

    let notification = wait_for_notification(&mut manager, started).expect("completion should arrive");
    match notification {
        TerminalNotification::Complete { token, transaction_id, payload, .. } => {
            assert_eq!(token, 7);
            assert_eq!(transaction_id, accepted.transaction_id);
            assert_eq!(payload.as_slice(), &[215, 480]);
        }
        other => panic!("unexpected notification: {other:?}"),
    }
    assert!(manager.is_idle());

    drop(manager);
    worker.join().unwrap();
}

#[test]
fn test_silent_wire_times_out_exactly_once() {
    let (wire_tx, _wire_rx) = unbounded::<BusRequest>();
    let (_completions, receiver) = completion_channel(4);
    let mut manager = BusTransactionManager::new(ThreadedBus { wire: wire_tx }, receiver, 50);

    let started = Instant::now();
    manager.issue(DeviceId(0), &sensor(), 0).unwrap();

    let notification = wait_for_notification(&mut manager, started).expect("timeout should be synthesized");
    assert!(matches!(
        notification,
        TerminalNotification::Failed { kind: FailureKind::Timeout, token: 7, .. }
    ));
    assert!(started.elapsed() >= Duration::from_millis(50));

    assert!(manager.poll(10_000).is_none());
    assert_eq!(manager.get_stats().timeouts_synthesized, 1);
    assert_eq!(manager.get_stats().total_failed, 1);
}

#[test]
fn test_busy_until_previous_transaction_resolves() {
    let (wire_tx, wire_rx) = unbounded::<BusRequest>();
    let (completions, receiver) = completion_channel(4);
    let mut manager = BusTransactionManager::new(ThreadedBus { wire: wire_tx }, receiver, 2000);
    let descriptor = sensor();

    manager.issue(DeviceId(0), &descriptor, 0).unwrap();
    assert!(matches!(
        manager.issue(DeviceId(0), &descriptor, 5),
        Err(IssueError::BusBusy { pending_token: 7, .. })
    ));

    let request = wire_rx.try_recv().unwrap();
    completions.deliver(BusEvent::fault(&request, FailureKind::ChecksumError)).unwrap();
    assert!(matches!(
        manager.poll(20),
        Some(TerminalNotification::Failed { kind: FailureKind::ChecksumError, .. })
    ));

    assert!(manager.issue(DeviceId(0), &descriptor, 30).is_ok());
    assert_eq!(manager.get_stats().total_issued, 2);
    assert_eq!(manager.get_stats().rejected_busy, 1);
}

#[test]
fn test_dropped_receiver_reports_disconnected() {
    let (completions, receiver) = completion_channel(1);
    drop(receiver);

    let request = BusRequest {
        transaction_id: 1,
        token: 7,
        address: 1,
        function: FunctionCode::ReadInputRegisters,
        start_register: 1,
        register_count: 2,
    };
    assert_eq!(
        completions.deliver(BusEvent::fault(&request, FailureKind::Timeout)),
        Err(TransportError::Disconnected)
    );
}
