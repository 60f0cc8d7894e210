mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use xrp_link_lib::bluetooth::BlePeripheral;
use xrp_link_lib::config::LinkConfig;
use xrp_link_lib::connection::{BleConnection, Connection, ConnectionState, Payload};
use xrp_link_lib::device::{DeviceError, TransportKind};
use xrp_link_lib::repl::ReplOutput;

fn ble_config() -> LinkConfig {
    LinkConfig {
        ble_reconnect_timeout_ms: 300,
        ..fast_config()
    }
}

fn recorded_states(conn: &BleConnection) -> Arc<Mutex<Vec<ConnectionState>>> {
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = states.clone();
    conn.core().set_status_callback(Arc::new(move |transport, state| {
        assert_eq!(transport, TransportKind::Bluetooth);
        sink.lock().unwrap().push(state);
    }));
    states
}

async fn connected(robot: &Arc<MockPeripheral>) -> (BleConnection, Arc<MockBleHost>) {
    let host = MockBleHost::offering(robot.clone());
    let conn = BleConnection::new(host.clone(), &ble_config());
    conn.connect().await.unwrap();
    (conn, host)
}

#[tokio::test]
async fn connect_offers_robots_by_name_prefix() {
    let robot = MockPeripheral::new("XRP-1234");
    let (conn, host) = connected(&robot).await;

    assert!(conn.is_connected());
    assert_eq!(conn.port_name().await.as_deref(), Some("XRP-1234"));
    assert_eq!(*host.prefixes.lock().unwrap(), vec!["XRP".to_string()]);
    assert!(robot.is_connected().await);
}

#[tokio::test]
async fn notifications_reach_the_data_callback() {
    let robot = MockPeripheral::new("XRP-1234");
    let (conn, _host) = connected(&robot).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    conn.core()
        .set_data_callback(Arc::new(move |_, output| sink.lock().unwrap().push(output)));

    assert!(robot.notify(b">>> ").await);

    assert!(eventually(|| !seen.lock().unwrap().is_empty()).await);
    assert_eq!(seen.lock().unwrap()[0], ReplOutput::Terminal(">>> ".into()));
}

#[tokio::test]
async fn writes_go_to_the_robot_in_order() {
    let robot = MockPeripheral::new("XRP-1234");
    let (conn, _host) = connected(&robot).await;

    conn.write_to_device(Payload::Text("print(1)")).await.unwrap();
    conn.write_to_device(Payload::Bytes(b"\r")).await.unwrap();

    assert_eq!(robot.written_text(), "print(1)\r");
}

#[tokio::test]
async fn cancelled_selection_is_not_an_error() {
    let conn = BleConnection::new(Arc::new(MockBleHost::default()), &ble_config());
    let states = recorded_states(&conn);

    conn.connect().await.unwrap();

    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(
        *states.lock().unwrap(),
        vec![ConnectionState::Busy, ConnectionState::Disconnected]
    );
}

#[tokio::test]
async fn failed_gatt_connect_is_reported() {
    let robot = MockPeripheral::new("XRP-1234");
    robot.failing_connects.store(1, Ordering::SeqCst);
    let conn = BleConnection::new(MockBleHost::offering(robot.clone()), &ble_config());

    let err = conn.connect().await.unwrap_err();

    assert!(matches!(err, DeviceError::Negotiation(_)));
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert!(conn.port_name().await.is_none());
}

#[tokio::test]
async fn lost_link_is_won_back() {
    let robot = MockPeripheral::new("XRP-1234");
    let host = MockBleHost::offering(robot.clone());
    let conn = BleConnection::new(host, &ble_config());
    let states = recorded_states(&conn);
    conn.connect().await.unwrap();

    robot.drop_link();

    assert!(eventually(|| states.lock().unwrap().len() == 5).await);
    assert_eq!(
        *states.lock().unwrap(),
        vec![
            ConnectionState::Busy,
            ConnectionState::Connected,
            ConnectionState::Disconnected,
            ConnectionState::Busy,
            ConnectionState::Connected
        ]
    );
    assert_eq!(robot.connects.load(Ordering::SeqCst), 2);
    assert!(robot.notify(b"back").await);
}

#[tokio::test]
async fn reconnect_gives_up_after_the_timeout() {
    let robot = MockPeripheral::new("XRP-1234");
    let (conn, _host) = connected(&robot).await;
    let states = recorded_states(&conn);
    robot.failing_connects.store(usize::MAX, Ordering::SeqCst);

    robot.drop_link();

    assert!(eventually(|| states.lock().unwrap().len() == 3).await);
    assert_eq!(
        *states.lock().unwrap(),
        vec![
            ConnectionState::Disconnected,
            ConnectionState::Busy,
            ConnectionState::Disconnected
        ]
    );
    let mut forgotten = false;
    for _ in 0..200 {
        if conn.port_name().await.is_none() {
            forgotten = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(forgotten);

    conn.write_to_device(Payload::Text("x")).await.unwrap();
    assert!(robot.written.lock().unwrap().is_empty());
}

#[tokio::test]
async fn explicit_disconnect_is_final() {
    let robot = MockPeripheral::new("XRP-1234");
    let (conn, _host) = connected(&robot).await;
    let states = recorded_states(&conn);

    conn.disconnect().await.unwrap();
    conn.disconnect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(*states.lock().unwrap(), vec![ConnectionState::Disconnected]);
    assert_eq!(robot.connects.load(Ordering::SeqCst), 1);
    assert!(!robot.is_connected().await);
    assert!(conn.port_name().await.is_none());
}

#[tokio::test]
async fn second_connect_while_connected_is_a_no_op() {
    let robot = MockPeripheral::new("XRP-1234");
    let (conn, host) = connected(&robot).await;

    conn.connect().await.unwrap();

    assert_eq!(host.prefixes.lock().unwrap().len(), 1);
    assert_eq!(robot.connects.load(Ordering::SeqCst), 1);
}
