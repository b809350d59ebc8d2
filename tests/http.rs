use once_cell::sync::Lazy;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::net::TcpListener;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Stats {
    knocks: u64,
    effective_interactions: u64,
    rgus: u64,
    conversion_rate: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TodayResponse {
    user_id: String,
    date: String,
    stats: Stats,
    persistent: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Member {
    user_id: String,
    is_active: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TeamResponse {
    date: String,
    total_knocks: u64,
    total_interactions: u64,
    total_rgus: u64,
    average_conversion: f64,
    active_members: usize,
    per_member: Vec<Member>,
}

struct TestServer {
    base_url: String,
    child: Child,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

static TEST_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));
static SERVER: Lazy<Mutex<Option<Arc<TestServer>>>> = Lazy::new(|| Mutex::new(None));

#[cfg(unix)]
mod cleanup {
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Once;

    static REGISTER: Once = Once::new();
    static PID: AtomicI32 = AtomicI32::new(0);

    pub fn register(pid: u32) {
        REGISTER.call_once(|| {
            PID.store(pid as i32, Ordering::SeqCst);
            unsafe {
                libc::atexit(on_exit);
            }
        });
    }

    extern "C" fn on_exit() {
        let pid = PID.load(Ordering::SeqCst);
        if pid > 0 {
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
    }
}

fn pick_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind random port");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn unique_data_path() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let mut path = std::env::temp_dir();
    path.push(format!("salestrack_http_{}_{}.json", std::process::id(), nanos));
    path.to_string_lossy().to_string()
}

async fn wait_until_ready(base_url: &str) {
    let client = Client::new();
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        if let Ok(resp) = client.get(format!("{base_url}/api/status")).send().await {
            if resp.status().is_success() {
                return;
            }
        }
        if Instant::now() > deadline {
            panic!("server did not become ready");
        }
        sleep(Duration::from_millis(100)).await;
    }
}

async fn spawn_server() -> TestServer {
    let port = pick_free_port();
    let data_path = unique_data_path();
    let child = Command::new(env!("CARGO_BIN_EXE_salestrack"))
        .env("PORT", port.to_string())
        .env("APP_STORE", "file")
        .env("APP_DATA_PATH", data_path)
        .env("RUST_LOG", "info")
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .expect("failed to spawn server");

    #[cfg(unix)]
    cleanup::register(child.id());

    let base_url = format!("http://127.0.0.1:{port}");
    wait_until_ready(&base_url).await;

    TestServer { base_url, child }
}

async fn shared_server() -> Arc<TestServer> {
    let mut guard = SERVER.lock().await;
    if let Some(server) = guard.as_ref() {
        return Arc::clone(server);
    }
    let server = Arc::new(spawn_server().await);
    *guard = Some(Arc::clone(&server));
    server
}

async fn adjust(client: &Client, server: &TestServer, user: &str, field: &str, delta: i64) -> TodayResponse {
    let response = client
        .post(server.url(&format!("/api/users/{user}/adjust")))
        .json(&serde_json::json!({ "field": field, "delta": delta }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    response.json().await.unwrap()
}

async fn get_json<T: DeserializeOwned>(client: &Client, server: &TestServer, path: &str) -> T {
    let response = client.get(server.url(path)).send().await.unwrap();
    assert!(response.status().is_success(), "GET {path} returned {}", response.status());
    response.json().await.unwrap()
}

async fn today(client: &Client, server: &TestServer, user: &str) -> TodayResponse {
    get_json(client, server, &format!("/api/users/{user}/today")).await
}

#[tokio::test]
async fn http_adjust_updates_today() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let client = Client::new();

    let before = today(&client, &server, "rep-adjust").await;
    assert_eq!(before.stats.knocks, 0);
    assert!(before.persistent);

    for _ in 0..4 {
        adjust(&client, &server, "rep-adjust", "knocks", 1).await;
    }
    adjust(&client, &server, "rep-adjust", "effectiveInteractions", 2).await;
    let updated = adjust(&client, &server, "rep-adjust", "rgus", 1).await;

    assert_eq!(updated.user_id, "rep-adjust");
    assert_eq!(updated.stats.knocks, 4);
    assert_eq!(updated.stats.effective_interactions, 2);
    assert_eq!(updated.stats.rgus, 1);
    assert_eq!(updated.stats.conversion_rate, 25.0);

    let after = today(&client, &server, "rep-adjust").await;
    assert_eq!(after.stats.knocks, 4);
    assert_eq!(after.date, updated.date);
    assert!(!after.date.is_empty());
}

#[tokio::test]
async fn http_decrement_clamps_at_zero() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let client = Client::new();

    adjust(&client, &server, "rep-clamp", "knocks", 3).await;
    let clamped = adjust(&client, &server, "rep-clamp", "knocks", -5).await;
    assert_eq!(clamped.stats.knocks, 0);
    assert_eq!(clamped.stats.conversion_rate, 0.0);
}

#[tokio::test]
async fn http_concurrent_increments_all_land() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let client = Client::new();

    let requests: Vec<_> = (0..10)
        .map(|_| {
            let client = client.clone();
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                adjust(&client, &server, "rep-race", "knocks", 1).await;
            })
        })
        .collect();
    for request in requests {
        request.await.unwrap();
    }

    let after = today(&client, &server, "rep-race").await;
    assert_eq!(after.stats.knocks, 10);
}

#[tokio::test]
async fn http_team_rolls_up_members() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let client = Client::new();

    let first = adjust(&client, &server, "team-a", "knocks", 10).await;
    adjust(&client, &server, "team-a", "rgus", 3).await;
    adjust(&client, &server, "team-b", "knocks", 20).await;
    adjust(&client, &server, "team-b", "rgus", 1).await;

    let team: TeamResponse = get_json(&client, &server, &format!("/api/team?date={}", first.date)).await;

    assert_eq!(team.date, first.date);
    let members: Vec<&Member> = team
        .per_member
        .iter()
        .filter(|m| m.user_id.starts_with("team-"))
        .collect();
    assert_eq!(members.len(), 2);
    assert_eq!(members[0].user_id, "team-b");
    assert!(members.iter().all(|m| m.is_active));
    assert!(team.total_knocks >= 30);
    assert!(team.total_rgus >= 4);
    assert!(team.active_members >= 2);
    assert!(team.average_conversion > 0.0);
}

#[tokio::test]
async fn http_team_for_empty_date_is_zero() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let client = Client::new();

    let team: TeamResponse = get_json(&client, &server, "/api/team?date=1999-01-01").await;

    assert_eq!(team.total_knocks, 0);
    assert_eq!(team.total_interactions, 0);
    assert_eq!(team.total_rgus, 0);
    assert_eq!(team.average_conversion, 0.0);
    assert_eq!(team.active_members, 0);
    assert!(team.per_member.is_empty());
}

#[tokio::test]
async fn http_rejects_bad_input() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let client = Client::new();

    let response = client
        .post(server.url("/api/users/rep-bad/adjust"))
        .json(&serde_json::json!({ "field": "sales" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = client
        .get(server.url("/api/team?date=yesterday"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
