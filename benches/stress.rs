use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_postgres::{Client, Config, NoTls};
use ulid::Ulid;

const MINUTE: i64 = 60_000;
/// 2030-01-07 00:00 UTC, a Monday.
const BASE: i64 = 1_893_974_400_000;
const BASE_DATE: &str = "2030-01-07";

async fn connect(host: &str, port: u16, password: &str) -> Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("clinic")
        .user("bench")
        .password(password);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

#[derive(Clone)]
struct Target {
    host: String,
    port: u16,
    password: String,
}

impl Target {
    async fn client(&self) -> Client {
        connect(&self.host, self.port, &self.password).await
    }
}

/// A clinic open every day 07:00-19:00 UTC with one new professional.
async fn seed_clinic(client: &Client) -> (Ulid, Ulid) {
    let clinic = Ulid::new();
    let professional = Ulid::new();
    let mut sql = format!("INSERT INTO clinics (id, name, timezone) VALUES ('{clinic}', 'bench', 'UTC');");
    sql.push_str("INSERT INTO opening_hours (clinic_id, weekday, open, close) VALUES ");
    let days: Vec<String> = (0..7)
        .map(|d| format!("('{clinic}', {d}, '07:00', '19:00')"))
        .collect();
    sql.push_str(&days.join(", "));
    sql.push(';');
    sql.push_str(&format!(
        "INSERT INTO professionals (id, name, active) VALUES ('{professional}', 'bench', true);"
    ));
    client.batch_execute(&sql).await.expect("seed failed");
    (clinic, professional)
}

fn book_sql(clinic: Ulid, professional: Ulid, start: i64, duration: i64) -> String {
    format!(
        "INSERT INTO appointments (clinic_id, professional_id, patient_id, type_id, start, duration) \
         VALUES ('{clinic}', '{professional}', '{}', '{}', {start}, {duration})",
        Ulid::new(),
        Ulid::new()
    )
}

async fn phase1_sequential(target: &Target) {
    let client = target.client().await;
    let (clinic, professional) = seed_clinic(&client).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let s = BASE + (i as i64) * 30 * MINUTE;
        let t = Instant::now();
        client
            .batch_execute(&book_sql(clinic, professional, s, 30))
            .await
            .expect("booking failed");
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("booking latency", &mut latencies);
}

/// Many clients race for the same few slots of one professional.
async fn phase2_contention(target: &Target) {
    let setup = target.client().await;
    let (clinic, professional) = seed_clinic(&setup).await;

    let n_tasks = 20;
    let n_slots = 50;
    let booked = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let target = target.clone();
        let booked = booked.clone();
        let conflicts = conflicts.clone();
        handles.push(tokio::spawn(async move {
            let client = target.client().await;
            for slot in 0..n_slots {
                let s = BASE + slot * 30 * MINUTE;
                match client.batch_execute(&book_sql(clinic, professional, s, 30)).await {
                    Ok(()) => booked.fetch_add(1, Ordering::Relaxed),
                    Err(e) if e.code().map(|c| c.code()) == Some("23P01") => {
                        conflicts.fetch_add(1, Ordering::Relaxed)
                    }
                    Err(e) => panic!("unexpected booking error: {e}"),
                };
            }
        }));
    }
    for h in handles {
        h.await.expect("task panicked");
    }

    let elapsed = start.elapsed();
    let ok = booked.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} clients x {n_slots} slots in {:.2}s: {ok} booked, {} conflicts",
        elapsed.as_secs_f64(),
        conflicts.load(Ordering::Relaxed)
    );
    assert_eq!(ok, n_slots as usize, "each slot must be booked exactly once");
}

async fn phase3_slots_under_load(target: &Target) {
    let setup = target.client().await;
    let (clinic, professional) = seed_clinic(&setup).await;
    for i in 0..8 {
        let s = BASE + 7 * 60 * MINUTE + i * 90 * MINUTE;
        setup
            .batch_execute(&book_sql(clinic, professional, s, 45))
            .await
            .expect("prefill failed");
    }
    drop(setup);

    let stop = Arc::new(AtomicBool::new(false));
    let mut writers = Vec::new();
    for _ in 0..5 {
        let target = target.clone();
        let stop = stop.clone();
        writers.push(tokio::spawn(async move {
            let client = target.client().await;
            let (wclinic, wpro) = seed_clinic(&client).await;
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let _ = client
                    .batch_execute(&book_sql(wclinic, wpro, BASE + i * 30 * MINUTE, 30))
                    .await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut readers = Vec::new();
    for _ in 0..n_readers {
        let target = target.clone();
        readers.push(tokio::spawn(async move {
            let client = target.client().await;
            let sql = format!(
                "SELECT * FROM slots WHERE clinic_id = '{clinic}' AND professional_id = '{professional}' \
                 AND date = '{BASE_DATE}' AND duration = 30 AND granularity = 15"
            );
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client.simple_query(&sql).await.expect("slot query failed");
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in readers {
        all.extend(h.await.expect("reader panicked"));
    }
    stop.store(true, Ordering::Relaxed);
    for h in writers {
        let _ = h.await;
    }

    print_latency("slot query", &mut all);
}

async fn phase4_connection_storm(target: &Target) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let success = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..n_conns {
        let target = target.clone();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = target.client().await;
            let (clinic, professional) = seed_clinic(&client).await;
            for i in 0..ops_per_conn {
                client
                    .batch_execute(&book_sql(clinic, professional, BASE + i * 60 * MINUTE, 60))
                    .await
                    .expect("booking failed");
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} bookings each: {ok}/{n_conns} succeeded in {:.2}s",
        start.elapsed().as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let target = Target {
        host: std::env::var("CLINICSLOT_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
        port: std::env::var("CLINICSLOT_PORT")
            .unwrap_or_else(|_| "5433".into())
            .parse()
            .expect("invalid CLINICSLOT_PORT"),
        password: std::env::var("CLINICSLOT_PASSWORD").unwrap_or_else(|_| "clinicslot".into()),
    };

    println!("=== clinicslot stress benchmark ===");
    println!("target: {}:{}\n", target.host, target.port);

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&target).await;

    println!("\n[phase 2] contention on shared slots");
    phase2_contention(&target).await;

    println!("\n[phase 3] slot query latency under write load");
    phase3_slots_under_load(&target).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&target).await;

    println!("\n=== done ===");
}
