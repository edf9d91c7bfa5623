// Postgres-backed merge tests. They run only when TLC_TEST_DATABASE_URL points
// at a scratch database; every test works inside its own throwaway schema.

use std::path::PathBuf;

use sqlx::postgres::PgConnection;
use sqlx::{Connection, Row};
use tempfile::TempDir;
use tlc_core::{row_key, Category, ExtractDescriptor, GREEN_SCHEMA};
use tlc_warehouse::{
    annotate_staging, ensure_schema, load_and_merge_on, merge_into_target, stage_file, WarehouseError,
};
use uuid::Uuid;

const GREEN_HEADER: &str = "VendorID,lpep_pickup_datetime,lpep_dropoff_datetime,store_and_fwd_flag,RatecodeID,PULocationID,DOLocationID,passenger_count,trip_distance,fare_amount,extra,mta_tax,tip_amount,tolls_amount,ehail_fee,improvement_surcharge,total_amount,payment_type,trip_type,congestion_surcharge";

struct Scratch {
    conn: PgConnection,
    schema: String,
}

impl Scratch {
    async fn open() -> Option<Self> {
        let url = std::env::var("TLC_TEST_DATABASE_URL").ok()?;
        let mut conn = PgConnection::connect(&url).await.expect("connect to test database");
        let schema = format!("tlc_test_{}", Uuid::new_v4().simple());
        sqlx::query(&format!("CREATE SCHEMA {schema}"))
            .execute(&mut conn)
            .await
            .expect("create scratch schema");
        sqlx::query(&format!("SET search_path TO {schema}"))
            .execute(&mut conn)
            .await
            .expect("set search_path");
        Some(Self { conn, schema })
    }

    async fn count(&mut self, table: &str) -> i64 {
        sqlx::query(&format!("SELECT COUNT(*) AS n FROM {table}"))
            .fetch_one(&mut self.conn)
            .await
            .expect("count")
            .get("n")
    }

    async fn teardown(mut self) {
        sqlx::query(&format!("DROP SCHEMA {} CASCADE", self.schema))
            .execute(&mut self.conn)
            .await
            .expect("drop scratch schema");
    }
}

fn green_row(vendor: &str, pickup: &str, dropoff: &str, pu: &str, dof: &str, fare: &str, dist: &str, passengers: &str) -> String {
    format!(
        "{vendor},{pickup},{dropoff},N,1,{pu},{dof},{passengers},{dist},{fare},0.5,0.5,0,0,,0.3,7.3,2,1,"
    )
}

fn write_extract(dir: &TempDir, name: &str, rows: &[String]) -> PathBuf {
    let path = dir.path().join(name);
    let mut body = String::from(GREEN_HEADER);
    body.push('\n');
    for row in rows {
        body.push_str(row);
        body.push('\n');
    }
    std::fs::write(&path, body).expect("write extract");
    path
}

fn three_rows_two_trips() -> Vec<String> {
    vec![
        green_row("2", "2019-01-01 00:10:16", "2019-01-01 00:16:32", "97", "49", "6", "0.86", "1"),
        // same seven key fields as the first row, different passenger count
        green_row("2", "2019-01-01 00:10:16", "2019-01-01 00:16:32", "97", "49", "6", "0.86", "2"),
        green_row("1", "2019-01-01 00:27:11", "2019-01-01 00:31:38", "49", "189", "5.5", "0.66", "1"),
    ]
}

fn january() -> ExtractDescriptor {
    ExtractDescriptor::new(Category::Green, "2019-01".parse().unwrap())
}

#[tokio::test]
async fn duplicate_trips_collapse_and_rerun_inserts_nothing() {
    let Some(mut db) = Scratch::open().await else {
        return;
    };
    let schema = &GREEN_SCHEMA;
    ensure_schema(&mut db.conn, schema).await.unwrap();
    sqlx::query(
        "INSERT INTO green_tripdata_staging \
         (vendorid, lpep_pickup_datetime, lpep_dropoff_datetime, pulocationid, dolocationid, fare_amount, trip_distance, passenger_count) \
         VALUES ('2', '2019-01-01 00:10:16', '2019-01-01 00:16:32', '97', '49', 6, 0.86, 1), \
                ('2', '2019-01-01 00:10:16', '2019-01-01 00:16:32', '97', '49', 6, 0.86, 2), \
                ('1', '2019-01-01 00:27:11', '2019-01-01 00:31:38', '49', '189', 5.5, 0.66, 1)",
    )
    .execute(&mut db.conn)
    .await
    .unwrap();

    let annotated = annotate_staging(&mut db.conn, schema, "green_tripdata_2019-01.csv")
        .await
        .unwrap();
    assert_eq!(annotated, 3);

    assert_eq!(merge_into_target(&mut db.conn, schema).await.unwrap(), 2);
    assert_eq!(db.count("green_tripdata").await, 2);

    assert_eq!(merge_into_target(&mut db.conn, schema).await.unwrap(), 0);
    assert_eq!(db.count("green_tripdata").await, 2);

    db.teardown().await;
}

#[tokio::test]
async fn database_row_key_matches_rendered_text_key() {
    let Some(mut db) = Scratch::open().await else {
        return;
    };
    let dir = TempDir::new().unwrap();
    let path = write_extract(&dir, "green_tripdata_2019-01.csv", &three_rows_two_trips()[2..]);
    load_and_merge_on(&mut db.conn, &january(), &path).await.unwrap();

    let row = sqlx::query("SELECT row_key, source_filename FROM green_tripdata")
        .fetch_one(&mut db.conn)
        .await
        .unwrap();
    let stored: String = row.get("row_key");
    let filename: String = row.get("source_filename");
    let expected = row_key([
        Some("1"),
        Some("2019-01-01 00:27:11"),
        Some("2019-01-01 00:31:38"),
        Some("49"),
        Some("189"),
        Some("5.5"),
        Some("0.66"),
    ]);
    assert_eq!(stored, expected);
    assert_eq!(filename, "green_tripdata_2019-01.csv");

    db.teardown().await;
}

#[tokio::test]
async fn same_trip_from_another_file_is_not_reinserted() {
    let Some(mut db) = Scratch::open().await else {
        return;
    };
    let dir = TempDir::new().unwrap();
    let first = write_extract(&dir, "a.csv", &three_rows_two_trips());
    let report = load_and_merge_on(&mut db.conn, &january(), &first).await.unwrap();
    assert_eq!(report.rows_staged, 3);
    assert_eq!(report.rows_annotated, 3);
    assert_eq!(report.rows_inserted, 2);

    let rerun = load_and_merge_on(&mut db.conn, &january(), &first).await.unwrap();
    assert_eq!(rerun.rows_staged, 3);
    assert_eq!(rerun.rows_inserted, 0);

    let february = ExtractDescriptor::new(Category::Green, "2019-02".parse().unwrap());
    let overlap = write_extract(
        &dir,
        "b.csv",
        &[
            three_rows_two_trips().remove(0),
            green_row("2", "2019-02-01 08:00:00", "2019-02-01 08:20:00", "7", "8", "12", "3.1", "1"),
        ],
    );
    let report = load_and_merge_on(&mut db.conn, &february, &overlap).await.unwrap();
    assert_eq!(report.rows_inserted, 1);
    assert_eq!(db.count("green_tripdata").await, 3);

    db.teardown().await;
}

#[tokio::test]
async fn malformed_row_rolls_back_the_whole_run() {
    let Some(mut db) = Scratch::open().await else {
        return;
    };
    let dir = TempDir::new().unwrap();
    let good = write_extract(&dir, "good.csv", &three_rows_two_trips());
    load_and_merge_on(&mut db.conn, &january(), &good).await.unwrap();

    let mut rows = vec![green_row("1", "2019-01-05 10:00:00", "2019-01-05 10:10:00", "1", "2", "9", "1.2", "1")];
    rows.push("1,2019-01-05 11:00:00,too,few,columns".to_string());
    let bad = write_extract(&dir, "bad.csv", &rows);

    let err = load_and_merge_on(&mut db.conn, &january(), &bad).await.unwrap_err();
    assert!(matches!(err, WarehouseError::StagingLoad { .. }), "{err:?}");

    assert_eq!(db.count("green_tripdata").await, 2);
    // staging truncate was rolled back as well
    assert_eq!(db.count("green_tripdata_staging").await, 3);

    db.teardown().await;
}

#[tokio::test]
async fn header_for_other_category_is_rejected_before_copy() {
    let Some(mut db) = Scratch::open().await else {
        return;
    };
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("yellow_like.csv");
    std::fs::write(&path, "VendorID,tpep_pickup_datetime\n1,2019-01-01 00:00:00\n").unwrap();

    ensure_schema(&mut db.conn, &GREEN_SCHEMA).await.unwrap();
    let err = stage_file(&mut db.conn, &GREEN_SCHEMA, &path).await.unwrap_err();
    assert!(matches!(err, WarehouseError::StagingLoad { table: "green_tripdata_staging", .. }));

    db.teardown().await;
}
