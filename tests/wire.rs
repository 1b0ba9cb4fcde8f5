use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use uniroom::campus::CampusManager;
use uniroom::wire;

const H: i64 = 3_600_000; // 1 hour in ms
const MONDAY: i64 = 4 * 86_400_000; // 1970-01-05 was a Monday

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<CampusManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("uniroom_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let cm = Arc::new(CampusManager::new(dir, 1000));

    let cm2 = cm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let cm = cm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, cm, "uniroom".to_string(), None).await;
            });
        }
    });

    (addr, cm)
}

/// Connect as the given identity (`<role>_<ulid>`) against a campus.
async fn connect(addr: SocketAddr, campus: &str, user: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(campus)
        .user(user)
        .password("uniroom");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn identity(role: &str) -> String {
    format!("{role}_{}", Ulid::new())
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

fn db_message(err: tokio_postgres::Error) -> String {
    err.as_db_error()
        .map(|e| e.message().to_string())
        .unwrap_or_else(|| err.to_string())
}

async fn register_room(admin: &tokio_postgres::Client, number: &str) -> Ulid {
    let room_id = Ulid::new();
    admin
        .batch_execute(&format!(
            "INSERT INTO rooms (id, number) VALUES ('{room_id}', '{number}')"
        ))
        .await
        .unwrap();
    room_id
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn admin_registers_room_and_lists_it() {
    let (addr, _cm) = start_test_server().await;
    let admin = connect(addr, "main", &identity("admin")).await;

    let room_id = register_room(&admin, "B204").await;

    let rows = data_rows(admin.simple_query("SELECT * FROM rooms").await.unwrap());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("id"), Some(room_id.to_string().as_str()));
    assert_eq!(rows[0].get("number"), Some("B204"));
}

#[tokio::test]
async fn non_admin_cannot_touch_catalog_or_schedule() {
    let (addr, _cm) = start_test_server().await;
    let student = connect(addr, "main", &identity("student")).await;
    let teacher = connect(addr, "main", &identity("teacher")).await;

    let room_id = Ulid::new();
    for client in [&student, &teacher] {
        let err = client
            .batch_execute(&format!(
                "INSERT INTO rooms (id, number) VALUES ('{room_id}', 'B204')"
            ))
            .await
            .unwrap_err();
        assert!(db_message(err).contains("admin"));

        let err = client
            .batch_execute(&format!(
                r#"INSERT INTO schedule (id, room_id, day, start, "end", subject, semester) VALUES ('{}', '{room_id}', 'monday', 600, 660, 'Math', 'FS26')"#,
                Ulid::new()
            ))
            .await
            .unwrap_err();
        assert!(db_message(err).contains("admin"));
    }
}

#[tokio::test]
async fn unknown_role_in_user_is_rejected() {
    let (addr, _cm) = start_test_server().await;
    let client = connect(addr, "main", "janitor_01ARZ3NDEKTSV4RRFFQ69G5FAV").await;

    let err = client
        .simple_query("SELECT * FROM rooms")
        .await
        .unwrap_err();
    assert!(db_message(err).contains("<role>_<ulid>"));
}

#[tokio::test]
async fn reservation_returns_placement_row() {
    let (addr, _cm) = start_test_server().await;
    let admin = connect(addr, "main", &identity("admin")).await;
    let student = connect(addr, "main", &identity("student")).await;

    let room_id = register_room(&admin, "B204").await;

    let reservation_id = Ulid::new();
    let rows = data_rows(
        student
            .simple_query(&format!(
                r#"INSERT INTO reservations (id, room_id, start, "end") VALUES ('{reservation_id}', '{room_id}', {}, {})"#,
                MONDAY + 9 * H,
                MONDAY + 10 * H
            ))
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("id"), Some(reservation_id.to_string().as_str()));
    assert_eq!(rows[0].get("status"), Some("confirmed"));
    assert_eq!(rows[0].get("overridden_count"), Some("0"));
}

#[tokio::test]
async fn second_student_gets_tagged_conflict() {
    let (addr, _cm) = start_test_server().await;
    let admin = connect(addr, "main", &identity("admin")).await;
    let first = connect(addr, "main", &identity("student")).await;
    let second = connect(addr, "main", &identity("student")).await;

    let room_id = register_room(&admin, "B204").await;

    let first_id = Ulid::new();
    first
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, room_id, start, "end") VALUES ('{first_id}', '{room_id}', {}, {})"#,
            MONDAY + 9 * H,
            MONDAY + 10 * H
        ))
        .await
        .unwrap();

    let err = second
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, room_id, start, "end") VALUES ('{}', '{room_id}', {}, {})"#,
            Ulid::new(),
            MONDAY + 9 * H + 1800_000,
            MONDAY + 10 * H + 1800_000
        ))
        .await
        .unwrap_err();

    let message = db_message(err);
    assert!(message.starts_with("student_blocked:"), "got: {message}");
    // The JSON detail names the blocking reservation
    assert!(message.contains(&first_id.to_string()), "got: {message}");

    // The holder's reservation is untouched
    let rows = data_rows(
        first
            .simple_query("SELECT * FROM my_reservations")
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("status"), Some("confirmed"));
}

#[tokio::test]
async fn teacher_override_reports_count_and_feeds_ledger() {
    let (addr, _cm) = start_test_server().await;
    let admin = connect(addr, "main", &identity("admin")).await;
    let student_user = identity("student");
    let teacher_user = identity("teacher");
    let student = connect(addr, "main", &student_user).await;
    let teacher = connect(addr, "main", &teacher_user).await;

    let room_id = register_room(&admin, "B204").await;

    let student_reservation = Ulid::new();
    student
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, room_id, start, "end") VALUES ('{student_reservation}', '{room_id}', {}, {})"#,
            MONDAY + 9 * H,
            MONDAY + 10 * H
        ))
        .await
        .unwrap();

    let rows = data_rows(
        teacher
            .simple_query(&format!(
                r#"INSERT INTO reservations (id, room_id, start, "end") VALUES ('{}', '{room_id}', {}, {})"#,
                Ulid::new(),
                MONDAY + 9 * H,
                MONDAY + 10 * H
            ))
            .await
            .unwrap(),
    );
    assert_eq!(rows[0].get("status"), Some("confirmed"));
    assert_eq!(rows[0].get("overridden_count"), Some("1"));

    // The displaced student sees the override in their listing...
    let rows = data_rows(
        student
            .simple_query("SELECT * FROM my_reservations")
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("status"), Some("overridden"));
    assert_eq!(rows[0].get("overridden_by"), Some(teacher_user.as_str()));

    // ...and in their override feed
    let rows = data_rows(
        student
            .simple_query("SELECT * FROM overrides")
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("actor"), Some(teacher_user.as_str()));
    assert_eq!(
        rows[0].get("reservation_id"),
        Some(student_reservation.to_string().as_str())
    );

    // The winner's feed is empty: nothing of theirs was displaced
    let rows = data_rows(
        teacher
            .simple_query("SELECT * FROM overrides")
            .await
            .unwrap(),
    );
    assert!(rows.is_empty());
}

#[tokio::test]
async fn teacher_vs_teacher_is_tagged_conflict() {
    let (addr, _cm) = start_test_server().await;
    let admin = connect(addr, "main", &identity("admin")).await;
    let first = connect(addr, "main", &identity("teacher")).await;
    let second = connect(addr, "main", &identity("teacher")).await;

    let room_id = register_room(&admin, "B204").await;

    first
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, room_id, start, "end") VALUES ('{}', '{room_id}', {}, {})"#,
            Ulid::new(),
            MONDAY + 9 * H,
            MONDAY + 10 * H
        ))
        .await
        .unwrap();

    let err = second
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, room_id, start, "end") VALUES ('{}', '{room_id}', {}, {})"#,
            Ulid::new(),
            MONDAY + 9 * H,
            MONDAY + 10 * H
        ))
        .await
        .unwrap_err();
    assert!(db_message(err).starts_with("teacher_or_admin:"));
}

#[tokio::test]
async fn base_schedule_vetoes_admin_over_wire() {
    let (addr, _cm) = start_test_server().await;
    let admin = connect(addr, "main", &identity("admin")).await;

    let room_id = register_room(&admin, "B204").await;
    admin
        .batch_execute(&format!(
            r#"INSERT INTO schedule (id, room_id, day, start, "end", subject, semester) VALUES ('{}', '{room_id}', 'monday', 600, 660, 'Math', 'FS26')"#,
            Ulid::new()
        ))
        .await
        .unwrap();

    let err = admin
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, room_id, start, "end") VALUES ('{}', '{room_id}', {}, {})"#,
            Ulid::new(),
            MONDAY + 10 * H + 1800_000,
            MONDAY + 11 * H + 1800_000
        ))
        .await
        .unwrap_err();

    let message = db_message(err);
    assert!(message.starts_with("base_schedule:"), "got: {message}");
    assert!(message.contains("Math"), "got: {message}");
}

#[tokio::test]
async fn cancel_requires_owner_or_admin() {
    let (addr, _cm) = start_test_server().await;
    let admin = connect(addr, "main", &identity("admin")).await;
    let owner = connect(addr, "main", &identity("student")).await;
    let stranger = connect(addr, "main", &identity("student")).await;

    let room_id = register_room(&admin, "B204").await;

    let reservation_id = Ulid::new();
    owner
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, room_id, start, "end") VALUES ('{reservation_id}', '{room_id}', {}, {})"#,
            MONDAY + 9 * H,
            MONDAY + 10 * H
        ))
        .await
        .unwrap();

    let err = stranger
        .batch_execute(&format!(
            "DELETE FROM reservations WHERE id = '{reservation_id}'"
        ))
        .await
        .unwrap_err();
    assert!(db_message(err).contains("not the owner"));

    owner
        .batch_execute(&format!(
            "DELETE FROM reservations WHERE id = '{reservation_id}'"
        ))
        .await
        .unwrap();

    // Terminal records stay terminal, even for an admin
    let err = admin
        .batch_execute(&format!(
            "DELETE FROM reservations WHERE id = '{reservation_id}'"
        ))
        .await
        .unwrap_err();
    assert!(db_message(err).contains("already cancelled or overridden"));
}

#[tokio::test]
async fn room_day_merges_classes_and_reservations() {
    let (addr, _cm) = start_test_server().await;
    let admin = connect(addr, "main", &identity("admin")).await;
    let student_user = identity("student");
    let student = connect(addr, "main", &student_user).await;

    let room_id = register_room(&admin, "B204").await;
    admin
        .batch_execute(&format!(
            r#"INSERT INTO schedule (id, room_id, day, start, "end", subject, semester) VALUES ('{}', '{room_id}', 'monday', 600, 660, 'Math', 'FS26')"#,
            Ulid::new()
        ))
        .await
        .unwrap();
    student
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, room_id, start, "end") VALUES ('{}', '{room_id}', {}, {})"#,
            Ulid::new(),
            MONDAY + 14 * H,
            MONDAY + 15 * H
        ))
        .await
        .unwrap();

    let rows = data_rows(
        student
            .simple_query(&format!(
                "SELECT * FROM room_day WHERE room_id = '{room_id}' AND date = {}",
                MONDAY + 12 * H
            ))
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 2);

    // The recurring block materializes onto the queried date
    assert_eq!(rows[0].get("kind"), Some("class"));
    assert_eq!(rows[0].get("subject"), Some("Math"));
    assert_eq!(rows[0].get("start"), Some((MONDAY + 10 * H).to_string().as_str()));
    assert_eq!(rows[0].get("end"), Some((MONDAY + 11 * H).to_string().as_str()));

    assert_eq!(rows[1].get("kind"), Some("reservation"));
    assert_eq!(rows[1].get("owner"), Some(student_user.as_str()));
    assert_eq!(rows[1].get("status"), Some("confirmed"));
    assert_eq!(rows[1].get("subject"), None);
}

#[tokio::test]
async fn availability_excludes_classes_and_reservations() {
    let (addr, _cm) = start_test_server().await;
    let admin = connect(addr, "main", &identity("admin")).await;
    let student = connect(addr, "main", &identity("student")).await;

    let room_id = register_room(&admin, "B204").await;
    admin
        .batch_execute(&format!(
            r#"INSERT INTO schedule (id, room_id, day, start, "end", subject, semester) VALUES ('{}', '{room_id}', 'monday', 600, 660, 'Math', 'FS26')"#,
            Ulid::new()
        ))
        .await
        .unwrap();
    student
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, room_id, start, "end") VALUES ('{}', '{room_id}', {}, {})"#,
            Ulid::new(),
            MONDAY + 14 * H,
            MONDAY + 15 * H
        ))
        .await
        .unwrap();

    let rows = data_rows(
        student
            .simple_query(&format!(
                "SELECT * FROM availability WHERE room_id = '{room_id}' AND start >= {} AND \"end\" <= {}",
                MONDAY + 8 * H,
                MONDAY + 18 * H
            ))
            .await
            .unwrap(),
    );

    let windows: Vec<(String, String)> = rows
        .iter()
        .map(|r| {
            (
                r.get("start").unwrap().to_string(),
                r.get("end").unwrap().to_string(),
            )
        })
        .collect();
    let expected: Vec<(String, String)> = [
        (MONDAY + 8 * H, MONDAY + 10 * H),
        (MONDAY + 11 * H, MONDAY + 14 * H),
        (MONDAY + 15 * H, MONDAY + 18 * H),
    ]
    .iter()
    .map(|(a, b)| (a.to_string(), b.to_string()))
    .collect();
    assert_eq!(windows, expected);
}

#[tokio::test]
async fn campuses_are_isolated_over_wire() {
    let (addr, _cm) = start_test_server().await;
    let admin_north = connect(addr, "north", &identity("admin")).await;
    let admin_south = connect(addr, "south", &identity("admin")).await;

    let room_id = Ulid::new();
    for admin in [&admin_north, &admin_south] {
        admin
            .batch_execute(&format!(
                "INSERT INTO rooms (id, number) VALUES ('{room_id}', 'B204')"
            ))
            .await
            .unwrap();
    }

    // The same slot on the same room id books fine on both campuses
    let north_student = connect(addr, "north", &identity("student")).await;
    let south_student = connect(addr, "south", &identity("student")).await;
    for student in [&north_student, &south_student] {
        student
            .batch_execute(&format!(
                r#"INSERT INTO reservations (id, room_id, start, "end") VALUES ('{}', '{room_id}', {}, {})"#,
                Ulid::new(),
                MONDAY + 9 * H,
                MONDAY + 10 * H
            ))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let (addr, _cm) = start_test_server().await;
    let admin = connect(addr, "main", &identity("admin")).await;
    let student = connect(addr, "main", &identity("student")).await;

    let room_id = register_room(&admin, "B204").await;

    let reservation_id = Ulid::new();
    student
        .execute(
            r#"INSERT INTO reservations (id, room_id, start, "end") VALUES ($1, $2, $3, $4)"#,
            &[
                &reservation_id.to_string(),
                &room_id.to_string(),
                &(MONDAY + 9 * H).to_string(),
                &(MONDAY + 10 * H).to_string(),
            ],
        )
        .await
        .unwrap();

    let rows = data_rows(
        student
            .simple_query("SELECT * FROM my_reservations")
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("id"), Some(reservation_id.to_string().as_str()));
}
