use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Days, NaiveDate, Utc, Weekday};
use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use clinicslot::engine::Engine;
use clinicslot::notify::NotifyHub;
use clinicslot::wire;

// ── Test infrastructure ──────────────────────────────────────

const PASSWORD: &str = "clinicslot";

/// The first Monday at least a week from today.
fn monday() -> NaiveDate {
    let mut day = Utc::now().date_naive() + Days::new(7);
    while day.weekday() != Weekday::Mon {
        day = day.succ_opt().unwrap();
    }
    day
}

/// 09:00 UTC on [`monday`], in Unix ms.
fn monday_0900() -> i64 {
    monday().and_hms_opt(9, 0, 0).unwrap().and_utc().timestamp_millis()
}

async fn start_test_server() -> (SocketAddr, Arc<NotifyHub>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("clinicslot_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let hub = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(dir.join("clinicslot.wal"), hub.clone()).unwrap());

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, PASSWORD.to_string(), None).await;
            });
        }
    });

    (addr, hub)
}

async fn connect(addr: SocketAddr) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("clinic")
        .user("frontdesk")
        .password(PASSWORD);

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn column(rows: &[SimpleQueryRow], name: &str) -> Vec<String> {
    rows.iter()
        .map(|r| r.get(name).unwrap_or_default().to_string())
        .collect()
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code().map(|c| c.code().to_string()).unwrap_or_default()
}

/// Clinic open Monday 08:00-12:00 UTC with one active professional.
async fn seed(client: &Client) -> (Ulid, Ulid) {
    let clinic = Ulid::new();
    let professional = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO clinics (id, name, timezone) VALUES ('{clinic}', 'Centro', 'UTC');
             INSERT INTO opening_hours (clinic_id, weekday, open, close) VALUES ('{clinic}', 1, '08:00', '12:00');
             INSERT INTO professionals (id, name, active) VALUES ('{professional}', 'Dra. Silva', true);"
        ))
        .await
        .unwrap();
    (clinic, professional)
}

fn book_sql(clinic: Ulid, professional: Ulid, start: &str, duration: i64) -> String {
    let patient = Ulid::new();
    let kind = Ulid::new();
    format!(
        "INSERT INTO appointments (clinic_id, professional_id, patient_id, type_id, start, duration) \
         VALUES ('{clinic}', '{professional}', '{patient}', '{kind}', {start}, {duration})"
    )
}

fn slots_sql(clinic: Ulid, professional: Ulid, duration: i64) -> String {
    format!(
        "SELECT * FROM slots WHERE clinic_id = '{clinic}' AND professional_id = '{professional}' \
         AND date = '{}' AND duration = {duration}",
        monday()
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn slots_reflect_bookings() {
    let (addr, _hub) = start_test_server().await;
    let client = connect(addr).await;
    let (clinic, professional) = seed(&client).await;

    let booked = rows(
        client
            .simple_query(&book_sql(clinic, professional, &monday_0900().to_string(), 30))
            .await
            .unwrap(),
    );
    assert_eq!(column(&booked, "status"), vec!["scheduled"]);
    assert_eq!(column(&booked, "start"), vec![monday_0900().to_string()]);

    let slots = rows(client.simple_query(&slots_sql(clinic, professional, 30)).await.unwrap());
    assert_eq!(
        column(&slots, "slot"),
        vec!["08:00", "08:30", "09:30", "10:00", "10:30", "11:00", "11:30"]
    );
}

#[tokio::test]
async fn booking_accepts_rfc3339_start() {
    let (addr, _hub) = start_test_server().await;
    let client = connect(addr).await;
    let (clinic, professional) = seed(&client).await;

    let booked = rows(
        client
            .simple_query(&book_sql(clinic, professional, &format!("'{}T06:00:00-03:00'", monday()), 60))
            .await
            .unwrap(),
    );
    assert_eq!(column(&booked, "start"), vec![monday_0900().to_string()]);
    assert_eq!(column(&booked, "end"), vec![(monday_0900() + 3_600_000).to_string()]);
}

#[tokio::test]
async fn overlapping_booking_is_exclusion_violation() {
    let (addr, _hub) = start_test_server().await;
    let client = connect(addr).await;
    let (clinic, professional) = seed(&client).await;

    client
        .simple_query(&book_sql(clinic, professional, &monday_0900().to_string(), 30))
        .await
        .unwrap();
    let overlapping = (monday_0900() + 15 * 60_000).to_string();
    assert_eq!(
        sqlstate(&client, &book_sql(clinic, professional, &overlapping, 30)).await,
        "23P01"
    );
}

#[tokio::test]
async fn error_codes_by_reason() {
    let (addr, _hub) = start_test_server().await;
    let client = connect(addr).await;
    let (clinic, professional) = seed(&client).await;

    // Zero duration, start in the past, unknown clinic.
    assert_eq!(
        sqlstate(&client, &book_sql(clinic, professional, &monday_0900().to_string(), 0)).await,
        "22023"
    );
    assert_eq!(
        sqlstate(&client, &book_sql(clinic, professional, "1000", 30)).await,
        "22023"
    );
    assert_eq!(
        sqlstate(&client, &book_sql(Ulid::new(), professional, &monday_0900().to_string(), 30)).await,
        "P0002"
    );
    assert_eq!(sqlstate(&client, "SELECT * FROM invoices").await, "42601");
    assert_eq!(
        sqlstate(
            &client,
            &format!("INSERT INTO clinics (id, timezone) VALUES ('{clinic}', 'UTC')")
        )
        .await,
        "23505"
    );
}

#[tokio::test]
async fn cancelled_appointment_is_terminal() {
    let (addr, _hub) = start_test_server().await;
    let client = connect(addr).await;
    let (clinic, professional) = seed(&client).await;

    let booked = rows(
        client
            .simple_query(&book_sql(clinic, professional, &monday_0900().to_string(), 30))
            .await
            .unwrap(),
    );
    let id = column(&booked, "id").remove(0);

    let cancelled = rows(
        client
            .simple_query(&format!("UPDATE appointments SET status = 'cancelled' WHERE id = '{id}'"))
            .await
            .unwrap(),
    );
    assert_eq!(column(&cancelled, "status"), vec!["cancelled"]);
    assert_eq!(
        sqlstate(
            &client,
            &format!("UPDATE appointments SET status = 'confirmed' WHERE id = '{id}'")
        )
        .await,
        "55000"
    );

    let slots = rows(client.simple_query(&slots_sql(clinic, professional, 30)).await.unwrap());
    assert_eq!(column(&slots, "slot").len(), 8);
}

#[tokio::test]
async fn calendar_view_flags_other_clinic() {
    let (addr, _hub) = start_test_server().await;
    let client = connect(addr).await;
    let (clinic, professional) = seed(&client).await;
    let other = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO clinics (id) VALUES ('{other}')"))
        .await
        .unwrap();
    client
        .simple_query(&book_sql(other, professional, &monday_0900().to_string(), 30))
        .await
        .unwrap();

    let day_start = monday_0900() - 9 * 3_600_000;
    let day_end = day_start + 24 * 3_600_000;
    let calendar = rows(
        client
            .simple_query(&format!(
                "SELECT * FROM appointments WHERE professional_id = '{professional}' \
                 AND start >= {day_start} AND \"end\" <= {day_end} AND active = true \
                 AND clinic_id = '{clinic}'"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(column(&calendar, "other_clinic"), vec!["t"]);

    let slots = rows(client.simple_query(&slots_sql(clinic, professional, 30)).await.unwrap());
    assert!(!column(&slots, "slot").contains(&"09:00".to_string()));
}

#[tokio::test]
async fn extended_protocol_slot_query() {
    let (addr, _hub) = start_test_server().await;
    let client = connect(addr).await;
    let (clinic, professional) = seed(&client).await;

    let rows = client
        .query(
            "SELECT * FROM slots WHERE clinic_id = $1 AND professional_id = $2 AND date = $3 AND duration = $4",
            &[&clinic.to_string(), &professional.to_string(), &monday().to_string(), &"60"],
        )
        .await
        .unwrap();
    let labels: Vec<String> = rows.iter().map(|r| r.get::<_, String>("slot")).collect();
    assert_eq!(labels, vec!["08:00", "09:00", "10:00", "11:00"]);
}

#[tokio::test]
async fn concurrent_clients_one_booking_wins() {
    let (addr, _hub) = start_test_server().await;
    let setup = connect(addr).await;
    let (clinic, professional) = seed(&setup).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let sql = book_sql(clinic, professional, &monday_0900().to_string(), 45);
        handles.push(tokio::spawn(async move {
            let client = connect(addr).await;
            client.simple_query(&sql).await.map(|_| ())
        }));
    }
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(()) => ok += 1,
            Err(e) => assert_eq!(e.code().map(|c| c.code()), Some("23P01")),
        }
    }
    assert_eq!(ok, 1);
}

#[tokio::test]
async fn booking_publishes_change_event() {
    let (addr, hub) = start_test_server().await;
    let client = connect(addr).await;
    let (clinic, professional) = seed(&client).await;
    let mut rx = hub.subscribe(professional);

    let booked = rows(
        client
            .simple_query(&book_sql(clinic, professional, &monday_0900().to_string(), 30))
            .await
            .unwrap(),
    );
    let id = column(&booked, "id").remove(0);

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("expected change event")
        .unwrap();
    let payload: serde_json::Value = serde_json::from_str(&event.payload().unwrap()).unwrap();
    assert_eq!(payload["entity"], "appointment");
    assert_eq!(payload["id"], id);
    assert_eq!(payload["changeType"], "insert");
}

#[tokio::test]
async fn batch_runs_every_statement() {
    let (addr, _hub) = start_test_server().await;
    let client = connect(addr).await;
    let (clinic, professional) = seed(&client).await;

    let hours = rows(
        client
            .simple_query(&format!("SELECT * FROM opening_hours WHERE clinic_id = '{clinic}'"))
            .await
            .unwrap(),
    );
    assert_eq!(column(&hours, "open"), vec!["08:00"]);
    assert_eq!(column(&hours, "close"), vec!["12:00"]);

    let professionals = rows(client.simple_query("SELECT * FROM professionals").await.unwrap());
    assert_eq!(column(&professionals, "id"), vec![professional.to_string()]);
}

#[tokio::test]
async fn batch_with_bad_statement_runs_nothing() {
    let (addr, _hub) = start_test_server().await;
    let client = connect(addr).await;
    let clinic = Ulid::new();

    let err = client
        .batch_execute(&format!(
            "INSERT INTO clinics (id) VALUES ('{clinic}'); SELECT * FROM invoices"
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code().map(|c| c.code()), Some("42601"));

    client
        .batch_execute(&format!("INSERT INTO clinics (id) VALUES ('{clinic}')"))
        .await
        .unwrap();
}

#[tokio::test]
async fn bound_text_with_placeholder_syntax_is_stored_verbatim() {
    let (addr, _hub) = start_test_server().await;
    let client = connect(addr).await;
    let (clinic, professional) = seed(&client).await;
    let patient = Ulid::new();

    client
        .execute(
            "INSERT INTO patients (id, name) VALUES ($1, $2)",
            &[&patient.to_string(), &"Costs $1 'per' visit"],
        )
        .await
        .unwrap();

    let booked = rows(
        client
            .simple_query(&format!(
                "INSERT INTO appointments (clinic_id, professional_id, patient_id, type_id, start, duration) \
                 VALUES ('{clinic}', '{professional}', '{patient}', '{}', {}, 30)",
                Ulid::new(),
                monday_0900()
            ))
            .await
            .unwrap(),
    );
    assert_eq!(column(&booked, "patient_name"), vec!["Costs $1 'per' visit"]);
}
