use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_postgres::error::SqlState;
use tokio_postgres::{
    AsyncMessage, Config, NoTls, Notification, SimpleQueryMessage, SimpleQueryRow,
};
use ulid::Ulid;

use rosterd::tenant::TenantManager;
use rosterd::wire;

const FUTURE: i64 = 4_070_908_800_000; // 2099-01-01 UTC in ms
const PAST: i64 = 1_577_923_200_000; // 2020-01-02 UTC in ms

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("rosterd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "rosterd".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect_db(
    addr: SocketAddr,
    dbname: &str,
) -> (
    tokio_postgres::Client,
    mpsc::UnboundedReceiver<Notification>,
) {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(dbname)
        .user("rosterd")
        .password("rosterd");

    let (client, mut connection) = config.connect(NoTls).await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let stream = stream::poll_fn(move |cx| connection.poll_message(cx));
        futures::pin_mut!(stream);
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(AsyncMessage::Notification(n)) => {
                    let _ = tx.send(n);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    (client, rx)
}

async fn connect(
    addr: SocketAddr,
) -> (
    tokio_postgres::Client,
    mpsc::UnboundedReceiver<Notification>,
) {
    connect_db(addr, "test").await
}

/// Wait for a notification with timeout.
async fn recv_notification(
    rx: &mut mpsc::UnboundedReceiver<Notification>,
    timeout: Duration,
) -> Option<Notification> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

fn data_rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn single_row(messages: Vec<SimpleQueryMessage>) -> SimpleQueryRow {
    let mut rows = data_rows(messages);
    assert_eq!(rows.len(), 1, "expected exactly one data row");
    rows.remove(0)
}

/// Register `n` users and return their ids.
async fn register_users(client: &tokio_postgres::Client, n: usize) -> Vec<Ulid> {
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        let uid = Ulid::new();
        client
            .batch_execute(&format!(
                "INSERT INTO users (id, name) VALUES ('{uid}', 'user-{i}')"
            ))
            .await
            .unwrap();
        ids.push(uid);
    }
    ids
}

async fn create_session(client: &tokio_postgres::Client, slots: u32) -> Ulid {
    let sid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO sessions (id, date, slots) VALUES ('{sid}', {FUTURE}, {slots})"
        ))
        .await
        .unwrap();
    sid
}

// ── Signup flow ──────────────────────────────────────────────

#[tokio::test]
async fn connect_and_query() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    let uid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO users (id, name) VALUES ('{uid}', 'Maria')"
        ))
        .await
        .unwrap();

    let rows = data_rows(client.simple_query("SELECT * FROM users").await.unwrap());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("id"), Some(uid.to_string().as_str()));
    assert_eq!(rows[0].get("name"), Some("Maria"));
}

#[tokio::test]
async fn signup_fills_seats_then_waitlists() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    let users = register_users(&client, 3).await;
    let sid = create_session(&client, 2).await;

    // First two signups get seats
    for (i, uid) in users.iter().take(2).enumerate() {
        let row = single_row(
            client
                .simple_query(&format!(
                    "INSERT INTO signups (session_id, user_id) VALUES ('{sid}', '{uid}')"
                ))
                .await
                .unwrap(),
        );
        assert_eq!(row.get("user_id"), Some(uid.to_string().as_str()));
        assert_eq!(row.get("status"), Some("confirmed"));
        assert_eq!(row.get("remaining"), Some((1 - i).to_string().as_str()));
    }

    // Third overflows to the waitlist
    let row = single_row(
        client
            .simple_query(&format!(
                "INSERT INTO signups (session_id, user_id) VALUES ('{sid}', '{}')",
                users[2]
            ))
            .await
            .unwrap(),
    );
    assert_eq!(row.get("status"), Some("waitlisted"));
    assert_eq!(row.get("remaining"), Some("0"));
    assert_eq!(row.get("waitlist_count"), Some("1"));

    // Listings reflect the split, in signup order
    let seated = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM participants WHERE session_id = '{sid}'"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(seated.len(), 2);
    assert_eq!(seated[0].get("position"), Some("1"));
    assert_eq!(seated[0].get("user_id"), Some(users[0].to_string().as_str()));
    assert_eq!(seated[1].get("user_id"), Some(users[1].to_string().as_str()));

    let waiting = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM waitlist WHERE session_id = '{sid}'"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].get("user_id"), Some(users[2].to_string().as_str()));

    // Session row carries the aggregates
    let session = single_row(
        client
            .simple_query(&format!("SELECT * FROM sessions WHERE id = '{sid}'"))
            .await
            .unwrap(),
    );
    assert_eq!(session.get("slots"), Some("2"));
    assert_eq!(session.get("remaining"), Some("0"));
    assert_eq!(session.get("waitlist_count"), Some("1"));
}

#[tokio::test]
async fn leave_reports_promotion() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    let users = register_users(&client, 2).await;
    let sid = create_session(&client, 1).await;

    for uid in &users {
        client
            .batch_execute(&format!(
                "INSERT INTO signups (session_id, user_id) VALUES ('{sid}', '{uid}')"
            ))
            .await
            .unwrap();
    }

    // Seated member leaves; the waitlist head takes the seat
    let row = single_row(
        client
            .simple_query(&format!(
                "DELETE FROM signups WHERE session_id = '{sid}' AND user_id = '{}'",
                users[0]
            ))
            .await
            .unwrap(),
    );
    assert_eq!(row.get("promoted"), Some(users[1].to_string().as_str()));
    assert_eq!(row.get("remaining"), Some("0"));
    assert_eq!(row.get("waitlist_count"), Some("0"));

    let seated = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM participants WHERE session_id = '{sid}'"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(seated.len(), 1);
    assert_eq!(seated[0].get("user_id"), Some(users[1].to_string().as_str()));

    // Leaving with nobody waiting frees the seat
    let row = single_row(
        client
            .simple_query(&format!(
                "DELETE FROM signups WHERE session_id = '{sid}' AND user_id = '{}'",
                users[1]
            ))
            .await
            .unwrap(),
    );
    assert_eq!(row.get("promoted"), None);
    assert_eq!(row.get("remaining"), Some("1"));
}

#[tokio::test]
async fn duplicate_signup_rejected() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    let users = register_users(&client, 2).await;
    let sid = create_session(&client, 1).await;

    for uid in &users {
        client
            .batch_execute(&format!(
                "INSERT INTO signups (session_id, user_id) VALUES ('{sid}', '{uid}')"
            ))
            .await
            .unwrap();
    }

    // Seated and waitlisted members both get the duplicate error class
    for uid in &users {
        let err = client
            .batch_execute(&format!(
                "INSERT INTO signups (session_id, user_id) VALUES ('{sid}', '{uid}')"
            ))
            .await
            .unwrap_err();
        let db = err.as_db_error().expect("expected db error");
        assert_eq!(db.code(), &SqlState::UNIQUE_VIOLATION);
    }
}

#[tokio::test]
async fn unknown_ids_rejected() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    let users = register_users(&client, 1).await;
    let sid = create_session(&client, 2).await;

    // Unknown session
    let err = client
        .batch_execute(&format!(
            "INSERT INTO signups (session_id, user_id) VALUES ('{}', '{}')",
            Ulid::new(),
            users[0]
        ))
        .await
        .unwrap_err();
    assert_eq!(
        err.as_db_error().expect("db error").code(),
        &SqlState::NO_DATA_FOUND
    );

    // Unregistered user
    let err = client
        .batch_execute(&format!(
            "INSERT INTO signups (session_id, user_id) VALUES ('{sid}', '{}')",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(
        err.as_db_error().expect("db error").code(),
        &SqlState::NO_DATA_FOUND
    );
}

#[tokio::test]
async fn admin_add_resolves_or_mints_users() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    let maria = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO users (id, name) VALUES ('{maria}', 'Maria')"
        ))
        .await
        .unwrap();
    let sid = create_session(&client, 1).await;

    // Known name resolves to the registered user
    let row = single_row(
        client
            .simple_query(&format!(
                "INSERT INTO participants (session_id, name) VALUES ('{sid}', 'Maria')"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(row.get("user_id"), Some(maria.to_string().as_str()));
    assert_eq!(row.get("status"), Some("confirmed"));

    // Unknown name mints a stub; the session is full so it waitlists
    let row = single_row(
        client
            .simple_query(&format!(
                "INSERT INTO participants (session_id, name) VALUES ('{sid}', 'Walk-in')"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(row.get("status"), Some("waitlisted"));
    let stub_id = row.get("user_id").expect("stub id").to_string();
    assert_ne!(stub_id, maria.to_string());

    // The stub is a queryable user with no email
    let users = data_rows(client.simple_query("SELECT * FROM users").await.unwrap());
    assert_eq!(users.len(), 2);
    let stub = users
        .iter()
        .find(|r| r.get("name") == Some("Walk-in"))
        .expect("stub user row");
    assert_eq!(stub.get("id"), Some(stub_id.as_str()));
    assert_eq!(stub.get("email"), None);
}

#[tokio::test]
async fn admin_add_repeat_reports_current_seat() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    let sid = create_session(&client, 1).await;

    let row = single_row(
        client
            .simple_query(&format!(
                "INSERT INTO participants (session_id, name) VALUES ('{sid}', 'Walk-in')"
            ))
            .await
            .unwrap(),
    );
    let walk_in = row.get("user_id").expect("user id").to_string();

    // The desk double-submits; the repeat succeeds and reports the held
    // seat instead of a duplicate error
    let row = single_row(
        client
            .simple_query(&format!(
                "INSERT INTO participants (session_id, name) VALUES ('{sid}', 'Walk-in')"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(row.get("user_id"), Some(walk_in.as_str()));
    assert_eq!(row.get("status"), Some("confirmed"));

    // The voluntary path still rejects the same duplicate
    let err = client
        .batch_execute(&format!(
            "INSERT INTO signups (session_id, user_id) VALUES ('{sid}', '{walk_in}')"
        ))
        .await
        .unwrap_err();
    let db = err.as_db_error().expect("expected db error");
    assert_eq!(db.code(), &SqlState::UNIQUE_VIOLATION);

    // One seat, one user: the repeat changed nothing
    let participants = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM participants WHERE session_id = '{sid}'"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(participants.len(), 1);
    let users = data_rows(client.simple_query("SELECT * FROM users").await.unwrap());
    assert_eq!(users.len(), 1);
}

#[tokio::test]
async fn resize_reports_moves() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    let users = register_users(&client, 3).await;
    let sid = create_session(&client, 1).await;

    for uid in &users {
        client
            .batch_execute(&format!(
                "INSERT INTO signups (session_id, user_id) VALUES ('{sid}', '{uid}')"
            ))
            .await
            .unwrap();
    }

    // Growth promotes the whole waitlist
    let row = single_row(
        client
            .simple_query(&format!(
                "UPDATE sessions SET slots = 3 WHERE id = '{sid}'"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(row.get("promoted"), Some("2"));
    assert_eq!(row.get("demoted"), Some("0"));
    assert_eq!(row.get("remaining"), Some("0"));
    assert_eq!(row.get("waitlist_count"), Some("0"));

    // Shrink pushes the most recently seated back, keeping their order
    let row = single_row(
        client
            .simple_query(&format!(
                "UPDATE sessions SET slots = 1 WHERE id = '{sid}'"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(row.get("promoted"), Some("0"));
    assert_eq!(row.get("demoted"), Some("2"));
    assert_eq!(row.get("waitlist_count"), Some("2"));

    let waiting = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM waitlist WHERE session_id = '{sid}'"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(waiting.len(), 2);
    assert_eq!(waiting[0].get("user_id"), Some(users[1].to_string().as_str()));
    assert_eq!(waiting[1].get("user_id"), Some(users[2].to_string().as_str()));
}

#[tokio::test]
async fn roster_query_returns_json() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    let users = register_users(&client, 2).await;
    let sid = create_session(&client, 1).await;

    for uid in &users {
        client
            .batch_execute(&format!(
                "INSERT INTO signups (session_id, user_id) VALUES ('{sid}', '{uid}')"
            ))
            .await
            .unwrap();
    }

    let row = single_row(
        client
            .simple_query(&format!(
                "SELECT * FROM roster WHERE session_id = '{sid}'"
            ))
            .await
            .unwrap(),
    );

    let participants: serde_json::Value =
        serde_json::from_str(row.get("participants").unwrap()).unwrap();
    let waitlist: serde_json::Value = serde_json::from_str(row.get("waitlist").unwrap()).unwrap();

    let seated = participants.as_array().expect("participants array");
    assert_eq!(seated.len(), 1);
    assert_eq!(seated[0]["id"], users[0].to_string());
    assert_eq!(seated[0]["name"], "user-0");

    let waiting = waitlist.as_array().expect("waitlist array");
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0]["id"], users[1].to_string());
}

#[tokio::test]
async fn locked_session_blocks_voluntary_leave() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    let users = register_users(&client, 1).await;
    let sid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO sessions (id, date, slots) VALUES ('{sid}', {PAST}, 4)"
        ))
        .await
        .unwrap();

    // Joining stays open past the cutoff
    client
        .batch_execute(&format!(
            "INSERT INTO signups (session_id, user_id) VALUES ('{sid}', '{}')",
            users[0]
        ))
        .await
        .unwrap();

    // Voluntary leave is closed
    let err = client
        .batch_execute(&format!(
            "DELETE FROM signups WHERE session_id = '{sid}' AND user_id = '{}'",
            users[0]
        ))
        .await
        .unwrap_err();
    assert_eq!(
        err.as_db_error().expect("db error").code(),
        &SqlState::OBJECT_NOT_IN_PREREQUISITE_STATE
    );

    // Admin removal still works
    let row = single_row(
        client
            .simple_query(&format!(
                "DELETE FROM participants WHERE session_id = '{sid}' AND user_id = '{}'",
                users[0]
            ))
            .await
            .unwrap(),
    );
    assert_eq!(row.get("promoted"), None);
}

#[tokio::test]
async fn tenants_are_isolated() {
    let (addr, _tm) = start_test_server().await;
    let (client_a, _rx_a) = connect_db(addr, "club_a").await;
    let (client_b, _rx_b) = connect_db(addr, "club_b").await;

    let sid = create_session(&client_a, 4).await;

    // The other tenant sees nothing
    let rows = data_rows(
        client_b
            .simple_query("SELECT * FROM sessions")
            .await
            .unwrap(),
    );
    assert!(rows.is_empty());

    // The same id is free in the other tenant
    client_b
        .batch_execute(&format!(
            "INSERT INTO sessions (id, date, slots) VALUES ('{sid}', {FUTURE}, 8)"
        ))
        .await
        .unwrap();

    let row = single_row(
        client_b
            .simple_query(&format!("SELECT * FROM sessions WHERE id = '{sid}'"))
            .await
            .unwrap(),
    );
    assert_eq!(row.get("slots"), Some("8"));
}

// ── LISTEN feeds ─────────────────────────────────────────────
//
// LISTEN turns the connection into a dedicated feed, so each
// subscriber sets up its state first, listens last, and mutations
// come from a second connection.

#[tokio::test]
async fn listen_receives_notification() {
    let (addr, _tm) = start_test_server().await;
    let (client1, mut rx1) = connect(addr).await;

    let users = register_users(&client1, 1).await;
    let sid = create_session(&client1, 4).await;

    client1
        .batch_execute(&format!("LISTEN session_{sid}"))
        .await
        .unwrap();

    let (client2, _rx2) = connect(addr).await;
    client2
        .batch_execute(&format!(
            "INSERT INTO signups (session_id, user_id) VALUES ('{sid}', '{}')",
            users[0]
        ))
        .await
        .unwrap();

    let notif = recv_notification(&mut rx1, Duration::from_secs(5)).await;
    assert!(notif.is_some(), "expected notification");
    assert_eq!(notif.unwrap().channel(), &format!("session_{sid}"));
}

#[tokio::test]
async fn notification_payload_is_valid_json() {
    let (addr, _tm) = start_test_server().await;
    let (client1, mut rx1) = connect(addr).await;

    let users = register_users(&client1, 1).await;
    let sid = create_session(&client1, 4).await;

    client1
        .batch_execute(&format!("LISTEN session_{sid}"))
        .await
        .unwrap();

    let (client2, _) = connect(addr).await;
    client2
        .batch_execute(&format!(
            "INSERT INTO signups (session_id, user_id) VALUES ('{sid}', '{}')",
            users[0]
        ))
        .await
        .unwrap();

    let notif = recv_notification(&mut rx1, Duration::from_secs(5))
        .await
        .expect("expected notification");

    let parsed: serde_json::Value = serde_json::from_str(notif.payload())
        .expect("notification payload should be valid JSON");
    assert!(parsed.is_object());
    assert_eq!(parsed["kind"], "joined");
    assert_eq!(parsed["user_id"], users[0].to_string());
    assert_eq!(parsed["seat"], "confirmed");
}

#[tokio::test]
async fn notification_only_on_subscribed_session() {
    let (addr, _tm) = start_test_server().await;
    let (client1, mut rx1) = connect(addr).await;

    let users = register_users(&client1, 1).await;
    let sid_a = create_session(&client1, 4).await;
    let sid_b = create_session(&client1, 4).await;

    // Listen only on A
    client1
        .batch_execute(&format!("LISTEN session_{sid_a}"))
        .await
        .unwrap();

    let (client2, _) = connect(addr).await;

    // Mutate B — should NOT trigger notification
    client2
        .batch_execute(&format!(
            "INSERT INTO signups (session_id, user_id) VALUES ('{sid_b}', '{}')",
            users[0]
        ))
        .await
        .unwrap();

    let notif = recv_notification(&mut rx1, Duration::from_millis(500)).await;
    assert!(
        notif.is_none(),
        "should not receive notification for unsubscribed session"
    );

    // Mutate A — SHOULD trigger notification
    client2
        .batch_execute(&format!(
            "INSERT INTO signups (session_id, user_id) VALUES ('{sid_a}', '{}')",
            users[0]
        ))
        .await
        .unwrap();

    let notif = recv_notification(&mut rx1, Duration::from_secs(5)).await;
    assert!(
        notif.is_some(),
        "should receive notification for subscribed session"
    );
    assert_eq!(notif.unwrap().channel(), &format!("session_{sid_a}"));
}

#[tokio::test]
async fn leave_notification_names_promoted() {
    let (addr, _tm) = start_test_server().await;
    let (client1, mut rx1) = connect(addr).await;

    let users = register_users(&client1, 2).await;
    let sid = create_session(&client1, 1).await;
    for uid in &users {
        client1
            .batch_execute(&format!(
                "INSERT INTO signups (session_id, user_id) VALUES ('{sid}', '{uid}')"
            ))
            .await
            .unwrap();
    }

    client1
        .batch_execute(&format!("LISTEN session_{sid}"))
        .await
        .unwrap();

    let (client2, _) = connect(addr).await;
    client2
        .batch_execute(&format!(
            "DELETE FROM signups WHERE session_id = '{sid}' AND user_id = '{}'",
            users[0]
        ))
        .await
        .unwrap();

    let notif = recv_notification(&mut rx1, Duration::from_secs(5))
        .await
        .expect("expected notification");
    let parsed: serde_json::Value = serde_json::from_str(notif.payload()).unwrap();
    assert_eq!(parsed["kind"], "left");
    assert_eq!(parsed["user_id"], users[0].to_string());
    assert_eq!(parsed["promoted"], users[1].to_string());
}

#[tokio::test]
async fn resize_notification_lists_moves() {
    let (addr, _tm) = start_test_server().await;
    let (client1, mut rx1) = connect(addr).await;

    let users = register_users(&client1, 2).await;
    let sid = create_session(&client1, 1).await;
    for uid in &users {
        client1
            .batch_execute(&format!(
                "INSERT INTO signups (session_id, user_id) VALUES ('{sid}', '{uid}')"
            ))
            .await
            .unwrap();
    }

    client1
        .batch_execute(&format!("LISTEN session_{sid}"))
        .await
        .unwrap();

    let (client2, _) = connect(addr).await;
    client2
        .batch_execute(&format!("UPDATE sessions SET slots = 2 WHERE id = '{sid}'"))
        .await
        .unwrap();

    let notif = recv_notification(&mut rx1, Duration::from_secs(5))
        .await
        .expect("expected notification");
    let parsed: serde_json::Value = serde_json::from_str(notif.payload()).unwrap();
    assert_eq!(parsed["kind"], "resized");
    assert_eq!(parsed["slots"], 2);
    assert_eq!(parsed["promoted"][0], users[1].to_string());
    assert!(parsed["demoted"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn delete_session_ends_feed() {
    let (addr, _tm) = start_test_server().await;
    let (client1, mut rx1) = connect(addr).await;

    let sid = create_session(&client1, 4).await;
    client1
        .batch_execute(&format!("LISTEN session_{sid}"))
        .await
        .unwrap();

    let (client2, _) = connect(addr).await;
    client2
        .batch_execute(&format!("DELETE FROM sessions WHERE id = '{sid}'"))
        .await
        .unwrap();

    let notif = recv_notification(&mut rx1, Duration::from_secs(5))
        .await
        .expect("expected the final notification");
    let parsed: serde_json::Value = serde_json::from_str(notif.payload()).unwrap();
    assert_eq!(parsed["kind"], "deleted");

    // The feed closes once the session is gone
    let after = recv_notification(&mut rx1, Duration::from_secs(1)).await;
    assert!(after.is_none(), "feed should end after session deletion");
}

#[tokio::test]
async fn listen_unknown_session_errors() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    let err = client
        .batch_execute(&format!("LISTEN session_{}", Ulid::new()))
        .await
        .unwrap_err();
    assert_eq!(
        err.as_db_error().expect("db error").code(),
        &SqlState::NO_DATA_FOUND
    );

    // A channel outside the session_{id} scheme is rejected too
    let err = client
        .batch_execute("LISTEN roster_updates")
        .await
        .unwrap_err();
    assert_eq!(
        err.as_db_error().expect("db error").code(),
        &SqlState::SYNTAX_ERROR_OR_ACCESS_RULE_VIOLATION
    );
}

#[tokio::test]
async fn disconnect_cleans_up() {
    let (addr, _tm) = start_test_server().await;
    let (client1, _rx1) = connect(addr).await;

    let users = register_users(&client1, 1).await;
    let sid = create_session(&client1, 4).await;

    client1
        .batch_execute(&format!("LISTEN session_{sid}"))
        .await
        .unwrap();

    // Drop the subscriber — should not panic or leak
    drop(client1);
    drop(_rx1);

    // Wait a bit for the server to clean up
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Another connection should still work fine
    let (client2, _) = connect(addr).await;
    client2
        .batch_execute(&format!(
            "INSERT INTO signups (session_id, user_id) VALUES ('{sid}', '{}')",
            users[0]
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn multiple_events_on_same_channel() {
    let (addr, _tm) = start_test_server().await;
    let (client1, mut rx1) = connect(addr).await;

    let sid = create_session(&client1, 10).await;
    client1
        .batch_execute(&format!("LISTEN session_{sid}"))
        .await
        .unwrap();

    let (client2, _) = connect(addr).await;

    // Send 3 mutations
    for i in 0..3 {
        client2
            .batch_execute(&format!(
                "INSERT INTO participants (session_id, name) VALUES ('{sid}', 'guest-{i}')"
            ))
            .await
            .unwrap();
    }

    // Should receive all 3 notifications
    let mut count = 0;
    for _ in 0..3 {
        if recv_notification(&mut rx1, Duration::from_secs(5))
            .await
            .is_some()
        {
            count += 1;
        }
    }
    assert_eq!(count, 3, "should receive all 3 notifications");
}
