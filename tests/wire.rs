use std::net::SocketAddr;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use slotkeeper::engine::Engine;
use slotkeeper::gateway::{Gateway, GatewayConfig};
use slotkeeper::notify::NotifyHub;
use slotkeeper::wire::{self, SlotkeeperFactory};

// ── Test infrastructure ──────────────────────────────────────

/// Monday 2030-03-04 at `h:m` UTC.
fn at(h: u32, m: u32) -> i64 {
    NaiveDate::from_ymd_opt(2030, 3, 4)
        .unwrap()
        .and_hms_opt(h, m, 0)
        .unwrap()
        .and_utc()
        .timestamp_millis()
}

/// Server whose clock is pinned to Monday 10:00.
async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotkeeper_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("slotkeeper.wal"), Arc::new(NotifyHub::new())).unwrap());
    let gateway = Arc::new(Gateway::with_clock(
        engine,
        GatewayConfig::default(),
        Arc::new(|| at(10, 0)),
    ));
    let factory = Arc::new(SlotkeeperFactory::new(gateway, "slotkeeper".to_string()));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let factory = factory.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, factory, None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("salon")
        .user("frontdesk")
        .password("slotkeeper");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(r) => Some(r),
            _ => None,
        })
        .collect()
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code()
        .map(|c| c.code().to_string())
        .unwrap_or_else(|| panic!("no SQLSTATE in {err}"))
}

struct Fixture {
    location: Ulid,
    haircut: Ulid,
    alice: Ulid,
}

/// UTC location, a 30-minute haircut, and Alice working Monday 09-17 with
/// a lunch break.
async fn setup(client: &Client) -> Fixture {
    let (location, haircut, alice) = (Ulid::new(), Ulid::new(), Ulid::new());
    let schedule = r#"{"mon": {"start": "09:00", "end": "17:00", "breaks": [{"start": "12:00", "end": "13:00"}]}}"#;
    client
        .simple_query(&format!(
            "INSERT INTO locations (id, name, timezone) VALUES ('{location}', 'Main St', 'UTC')"
        ))
        .await
        .unwrap();
    client
        .simple_query(&format!(
            "INSERT INTO services (id, name, category, duration) VALUES ('{haircut}', 'Haircut', 'hair', 30)"
        ))
        .await
        .unwrap();
    client
        .simple_query(&format!(
            "INSERT INTO staff (id, location_id, name, categories, schedule) \
             VALUES ('{alice}', '{location}', 'Alice', 'hair', '{schedule}')"
        ))
        .await
        .unwrap();
    Fixture {
        location,
        haircut,
        alice,
    }
}

fn confirm_sql(f: &Fixture, id: Ulid, start: i64, call_id: Option<&str>) -> String {
    let call = call_id.map_or("NULL".to_string(), |c| format!("'{c}'"));
    format!(
        "INSERT INTO appointments (id, staff_id, client, service_ids, start, channel, external_call_id) \
         VALUES ('{id}', '{}', 'Dana', '{}', {start}, 'voice', {call})",
        f.alice, f.haircut
    )
}

// ── Booking ──────────────────────────────────────────────────

#[tokio::test]
async fn wire_propose_then_confirm() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let f = setup(&client).await;

    let slots = rows(
        &client,
        &format!(
            "SELECT * FROM slots WHERE location_id = '{}' AND service_ids = '{}' AND date = '2030-03-04'",
            f.location, f.haircut
        ),
    )
    .await;
    // Clock is 10:00; default granularity is 15 minutes.
    assert_eq!(slots[0].get("start"), Some(at(10, 0).to_string().as_str()));
    assert_eq!(slots[0].get("end"), Some(at(10, 30).to_string().as_str()));
    assert_eq!(slots[0].get("available_staff"), Some(f.alice.to_string().as_str()));

    let id = Ulid::new();
    let booked = rows(&client, &confirm_sql(&f, id, at(14, 0), None)).await;
    assert_eq!(booked.len(), 1);
    assert_eq!(booked[0].get("id"), Some(id.to_string().as_str()));
    assert_eq!(booked[0].get("status"), Some("booked"));
    assert_eq!(booked[0].get("channel"), Some("voice"));
    assert_eq!(booked[0].get("date"), Some("2030-03-04"));

    // A second caller for the same time loses with an exclusion violation.
    let code = sqlstate(&client, &confirm_sql(&f, Ulid::new(), at(14, 15), None)).await;
    assert_eq!(code, "23P01");

    let listed = rows(
        &client,
        &format!(
            "SELECT * FROM appointments WHERE staff_id = '{}' AND date = '2030-03-04'",
            f.alice
        ),
    )
    .await;
    assert_eq!(listed.len(), 1);

    let slots = rows(
        &client,
        &format!(
            "SELECT * FROM slots WHERE location_id = '{}' AND service_ids = '{}' AND date = '2030-03-04' AND granularity = 30",
            f.location, f.haircut
        ),
    )
    .await;
    assert!(slots.iter().all(|r| r.get("start") != Some(at(14, 0).to_string().as_str())));
}

#[tokio::test]
async fn wire_repeated_call_id_books_once() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let f = setup(&client).await;

    let first = Ulid::new();
    let a = rows(&client, &confirm_sql(&f, first, at(15, 0), Some("call-42"))).await;
    let b = rows(&client, &confirm_sql(&f, Ulid::new(), at(15, 0), Some("call-42"))).await;
    assert_eq!(a[0].get("id"), Some(first.to_string().as_str()));
    assert_eq!(b[0].get("id"), Some(first.to_string().as_str()));
    assert_eq!(b[0].get("external_call_id"), Some("call-42"));

    let listed = rows(
        &client,
        &format!(
            "SELECT * FROM appointments WHERE staff_id = '{}' AND date = '2030-03-04'",
            f.alice
        ),
    )
    .await;
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn wire_move_and_status_changes() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let f = setup(&client).await;
    let id = Ulid::new();
    rows(&client, &confirm_sql(&f, id, at(14, 0), None)).await;

    let moved = rows(
        &client,
        &format!("UPDATE appointments SET start = {} WHERE id = '{id}'", at(15, 30)),
    )
    .await;
    assert_eq!(moved[0].get("start"), Some(at(15, 30).to_string().as_str()));

    // Moving into the lunch break is a validation failure.
    let code = sqlstate(
        &client,
        &format!("UPDATE appointments SET start = {} WHERE id = '{id}'", at(12, 0)),
    )
    .await;
    assert_eq!(code, "22023");

    for (status, expected) in [
        ("confirmed", "confirmed"),
        ("check_in", "checked_in"),
        ("in_service", "in_service"),
        ("completed", "completed"),
    ] {
        let updated = rows(
            &client,
            &format!("UPDATE appointments SET status = '{status}' WHERE id = '{id}'"),
        )
        .await;
        assert_eq!(updated[0].get("status"), Some(expected));
    }

    let code = sqlstate(
        &client,
        &format!("UPDATE appointments SET status = 'cancelled' WHERE id = '{id}'"),
    )
    .await;
    assert_eq!(code, "55000");

    let fetched = rows(&client, &format!("SELECT * FROM appointments WHERE id = '{id}'")).await;
    assert_eq!(fetched[0].get("status"), Some("completed"));
}

#[tokio::test]
async fn wire_time_off_round_trip() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let f = setup(&client).await;
    let slots_sql = format!(
        "SELECT * FROM slots WHERE location_id = '{}' AND service_ids = '{}' AND date = '2030-03-04' AND staff_id = '{}'",
        f.location, f.haircut, f.alice
    );

    let off = Ulid::new();
    client
        .simple_query(&format!(
            r#"INSERT INTO time_off (id, staff_id, start, "end", reason) VALUES ('{off}', '{}', '2030-03-04 09:00', '2030-03-04 15:00', 'training')"#,
            f.alice
        ))
        .await
        .unwrap();
    let slots = rows(&client, &slots_sql).await;
    assert_eq!(slots[0].get("start"), Some(at(15, 0).to_string().as_str()));

    client
        .simple_query(&format!("DELETE FROM time_off WHERE id = '{off}'"))
        .await
        .unwrap();
    let slots = rows(&client, &slots_sql).await;
    assert_eq!(slots[0].get("start"), Some(at(10, 0).to_string().as_str()));

    // Re-sending the staff row keeps time off already on file.
    client
        .simple_query(&format!(
            r#"INSERT INTO time_off (id, staff_id, start, "end") VALUES ('{}', '{}', '2030-03-04', '2030-03-05')"#,
            Ulid::new(),
            f.alice
        ))
        .await
        .unwrap();
    let schedule = r#"{"mon": {"start": "08:00", "end": "18:00"}}"#;
    client
        .simple_query(&format!(
            "INSERT INTO staff (id, location_id, name, categories, schedule) \
             VALUES ('{}', '{}', 'Alice', 'hair', '{schedule}')",
            f.alice, f.location
        ))
        .await
        .unwrap();
    assert!(rows(&client, &slots_sql).await.is_empty());
}

// ── Waitlist ─────────────────────────────────────────────────

#[tokio::test]
async fn wire_waitlist_queue_and_seat() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let f = setup(&client).await;

    let (sam, kim, lee) = (Ulid::new(), Ulid::new(), Ulid::new());
    for (id, name, minutes) in [(sam, "Sam", 20), (kim, "Kim", 40), (lee, "Lee", 30)] {
        client
            .simple_query(&format!(
                "INSERT INTO waitlist (id, location_id, name, service_ids, estimated_duration) \
                 VALUES ('{id}', '{}', '{name}', '{}', {minutes})",
                f.location, f.haircut
            ))
            .await
            .unwrap();
    }

    let queue = rows(&client, &format!("SELECT * FROM waitlist WHERE location_id = '{}'", f.location)).await;
    let summary: Vec<(Option<&str>, Option<&str>)> = queue
        .iter()
        .map(|r| (r.get("position"), r.get("estimated_wait")))
        .collect();
    assert_eq!(
        summary,
        vec![(Some("1"), Some("0")), (Some("2"), Some("20")), (Some("3"), Some("60"))]
    );

    let reordered = rows(&client, &format!("UPDATE waitlist SET position = 1 WHERE id = '{lee}'")).await;
    assert_eq!(reordered[0].get("position"), Some("1"));

    let appointment_id = Ulid::new();
    let seated = rows(
        &client,
        &format!(
            "UPDATE waitlist SET status = 'seated', staff_id = '{}', appointment_id = '{appointment_id}' WHERE id = '{lee}'",
            f.alice
        ),
    )
    .await;
    assert_eq!(seated[0].get("status"), Some("seated"));
    assert_eq!(seated[0].get("position"), None);
    assert_eq!(seated[0].get("appointment_id"), Some(appointment_id.to_string().as_str()));

    let appt = rows(&client, &format!("SELECT * FROM appointments WHERE id = '{appointment_id}'")).await;
    assert_eq!(appt[0].get("status"), Some("in_service"));
    assert_eq!(appt[0].get("channel"), Some("walk_in"));
    assert_eq!(appt[0].get("start"), Some(at(10, 0).to_string().as_str()));

    rows(&client, &format!("UPDATE waitlist SET status = 'left' WHERE id = '{sam}'")).await;
    let queue = rows(&client, &format!("SELECT * FROM waitlist WHERE location_id = '{}'", f.location)).await;
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].get("id"), Some(kim.to_string().as_str()));
    assert_eq!(queue[0].get("position"), Some("1"));

    let code = sqlstate(&client, &format!("UPDATE waitlist SET status = 'notified' WHERE id = '{sam}'")).await;
    assert_eq!(code, "55000");
}

// ── Errors ───────────────────────────────────────────────────

#[tokio::test]
async fn wire_reports_sqlstates() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let f = setup(&client).await;

    assert_eq!(sqlstate(&client, "SELECT * FROM nowhere").await, "42601");
    assert_eq!(sqlstate(&client, "THIS IS NOT SQL").await, "42601");
    assert_eq!(
        sqlstate(&client, &format!("DELETE FROM appointments WHERE id = '{}'", Ulid::new())).await,
        "42601"
    );
    assert_eq!(
        sqlstate(
            &client,
            &format!("SELECT * FROM appointments WHERE id = '{}'", Ulid::new())
        )
        .await,
        "22023"
    );
    assert_eq!(
        sqlstate(
            &client,
            &format!(
                "INSERT INTO locations (id, name, timezone) VALUES ('{}', 'Moon', 'Moon/Base')",
                Ulid::new()
            )
        )
        .await,
        "22023"
    );
    // Nobody works at 08:00.
    assert_eq!(
        sqlstate(&client, &confirm_sql(&f, Ulid::new(), at(8, 0), None)).await,
        "22023"
    );
}

#[tokio::test]
async fn wire_wrong_password_is_rejected() {
    let addr = start_test_server().await;
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("salon")
        .user("frontdesk")
        .password("wrong");
    assert!(config.connect(NoTls).await.is_err());
}
