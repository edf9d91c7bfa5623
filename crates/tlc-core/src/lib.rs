//! Core domain model for the NYC TLC monthly loader: taxi categories, their
//! static schema descriptors, extract descriptors and the row key.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, TimeZone};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "tlc-core";

/// Number of fields that make up a row key.
pub const KEY_FIELD_COUNT: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported taxi category: {value:?} (expected \"green\" or \"yellow\")")]
pub struct UnsupportedCategoryError {
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid period {value:?}: {reason}")]
pub struct PeriodParseError {
    pub value: String,
    pub reason: &'static str,
}

/// Taxi type discriminator. Selects the source path and the table schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Green,
    Yellow,
}

impl Category {
    pub const ALL: [Category; 2] = [Category::Green, Category::Yellow];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Green => "green",
            Category::Yellow => "yellow",
        }
    }

    pub fn schema(self) -> &'static TaxiSchema {
        match self {
            Category::Green => &GREEN_SCHEMA,
            Category::Yellow => &YELLOW_SCHEMA,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = UnsupportedCategoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "green" => Ok(Category::Green),
            "yellow" => Ok(Category::Yellow),
            other => Err(UnsupportedCategoryError {
                value: other.to_string(),
            }),
        }
    }
}

/// One natural column of a source extract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub sql_type: &'static str,
}

const fn col(name: &'static str, sql_type: &'static str) -> Column {
    Column { name, sql_type }
}

/// Static per-category schema: tables, pickup/dropoff columns and the
/// ordered column list of the source CSV.
#[derive(Debug, PartialEq, Eq)]
pub struct TaxiSchema {
    pub category: Category,
    pub target_table: &'static str,
    pub staging_table: &'static str,
    pub pickup_column: &'static str,
    pub dropoff_column: &'static str,
    pub columns: &'static [Column],
}

impl TaxiSchema {
    pub fn column_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns.iter().map(|c| c.name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    /// Columns hashed into the row key, in hashing order.
    pub fn key_columns(&self) -> [&'static str; KEY_FIELD_COUNT] {
        [
            "vendorid",
            self.pickup_column,
            self.dropoff_column,
            "pulocationid",
            "dolocationid",
            "fare_amount",
            "trip_distance",
        ]
    }
}

const TEXT: &str = "text";
const TIMESTAMP: &str = "timestamp";
const INTEGER: &str = "integer";
const DOUBLE: &str = "double precision";

pub static YELLOW_SCHEMA: TaxiSchema = TaxiSchema {
    category: Category::Yellow,
    target_table: "yellow_tripdata",
    staging_table: "yellow_tripdata_staging",
    pickup_column: "tpep_pickup_datetime",
    dropoff_column: "tpep_dropoff_datetime",
    columns: &[
        col("vendorid", TEXT),
        col("tpep_pickup_datetime", TIMESTAMP),
        col("tpep_dropoff_datetime", TIMESTAMP),
        col("passenger_count", INTEGER),
        col("trip_distance", DOUBLE),
        col("ratecodeid", TEXT),
        col("store_and_fwd_flag", TEXT),
        col("pulocationid", TEXT),
        col("dolocationid", TEXT),
        col("payment_type", INTEGER),
        col("fare_amount", DOUBLE),
        col("extra", DOUBLE),
        col("mta_tax", DOUBLE),
        col("tip_amount", DOUBLE),
        col("tolls_amount", DOUBLE),
        col("improvement_surcharge", DOUBLE),
        col("total_amount", DOUBLE),
        col("congestion_surcharge", DOUBLE),
    ],
};

pub static GREEN_SCHEMA: TaxiSchema = TaxiSchema {
    category: Category::Green,
    target_table: "green_tripdata",
    staging_table: "green_tripdata_staging",
    pickup_column: "lpep_pickup_datetime",
    dropoff_column: "lpep_dropoff_datetime",
    columns: &[
        col("vendorid", TEXT),
        col("lpep_pickup_datetime", TIMESTAMP),
        col("lpep_dropoff_datetime", TIMESTAMP),
        col("store_and_fwd_flag", TEXT),
        col("ratecodeid", TEXT),
        col("pulocationid", TEXT),
        col("dolocationid", TEXT),
        col("passenger_count", INTEGER),
        col("trip_distance", DOUBLE),
        col("fare_amount", DOUBLE),
        col("extra", DOUBLE),
        col("mta_tax", DOUBLE),
        col("tip_amount", DOUBLE),
        col("tolls_amount", DOUBLE),
        col("ehail_fee", DOUBLE),
        col("improvement_surcharge", DOUBLE),
        col("total_amount", DOUBLE),
        col("payment_type", INTEGER),
        col("trip_type", INTEGER),
        col("congestion_surcharge", DOUBLE),
    ],
};

/// A calendar month, the unit every run is partitioned by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    /// First month with a published extract.
    pub const FIRST: Period = Period { year: 2019, month: 1 };

    pub fn new(year: i32, month: u32) -> Result<Self, PeriodParseError> {
        let value = format!("{year}-{month}");
        if !(1000..=9999).contains(&year) {
            return Err(PeriodParseError {
                value,
                reason: "year must have four digits",
            });
        }
        if !(1..=12).contains(&month) {
            return Err(PeriodParseError {
                value,
                reason: "month must be between 01 and 12",
            });
        }
        let period = Self { year, month };
        if period < Self::FIRST {
            return Err(PeriodParseError {
                value,
                reason: "no extracts are published before 2019-01",
            });
        }
        Ok(period)
    }

    /// Month of `at` as seen in its own time zone.
    pub fn from_datetime<Tz: TimeZone>(at: &DateTime<Tz>) -> Result<Self, PeriodParseError> {
        Self::new(at.year(), at.month())
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = PeriodParseError;

    /// Accepts `YYYY-MM` or a monthly partition key `YYYY-MM-DD`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| PeriodParseError {
            value: s.to_string(),
            reason,
        };
        let bytes = s.as_bytes();
        if !s.is_ascii() || !(bytes.len() == 7 || bytes.len() == 10) || bytes[4] != b'-' {
            return Err(err("expected YYYY-MM or YYYY-MM-DD"));
        }
        if bytes.len() == 10 && bytes[7] != b'-' {
            return Err(err("expected YYYY-MM or YYYY-MM-DD"));
        }
        let digits = |range: std::ops::Range<usize>| {
            let part = &s[range];
            if part.bytes().all(|b| b.is_ascii_digit()) {
                part.parse::<u32>().ok()
            } else {
                None
            }
        };
        let year = digits(0..4).ok_or_else(|| err("year must have four digits"))?;
        let month = digits(5..7).ok_or_else(|| err("month must have two digits"))?;
        if bytes.len() == 10 {
            digits(8..10).ok_or_else(|| err("day must have two digits"))?;
            NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| err("not a calendar date"))?;
        }
        Period::new(year as i32, month).map_err(|e| PeriodParseError {
            value: s.to_string(),
            reason: e.reason,
        })
    }
}

/// Identifies one monthly source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtractDescriptor {
    pub category: Category,
    pub period: Period,
}

impl ExtractDescriptor {
    pub fn new(category: Category, period: Period) -> Self {
        Self { category, period }
    }

    pub fn schema(&self) -> &'static TaxiSchema {
        self.category.schema()
    }

    /// Local file name of the decompressed extract, also recorded as
    /// `source_filename` on every row it contributes.
    pub fn filename(&self) -> String {
        format!("{}_tripdata_{}.csv", self.category, self.period)
    }

    pub fn url(&self, base_url: &str) -> String {
        format!(
            "{}/{}/{}.gz",
            base_url.trim_end_matches('/'),
            self.category,
            self.filename()
        )
    }

    pub fn run_key(&self) -> String {
        run_key(self.category.as_str(), self.period)
    }
}

/// Run identifier `{category}_{YYYY}_{MM}`. Takes the raw category so a
/// rejected request still gets a key to report under.
pub fn run_key(category: &str, period: Period) -> String {
    format!("{}_{:04}_{:02}", category, period.year(), period.month())
}

/// Row key over the seven identifying fields rendered as text.
///
/// Mirrors the SQL used to annotate staged rows: each `None` becomes an empty
/// string, the fields are concatenated without a separator and the result is
/// SHA-256 hashed and hex encoded. Rows whose seven fields are all absent
/// therefore share a single key.
pub fn row_key(fields: [Option<&str>; KEY_FIELD_COUNT]) -> String {
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update(field.unwrap_or_default().as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone, Utc};

    const TRIP: [Option<&str>; KEY_FIELD_COUNT] = [
        Some("2"),
        Some("2019-01-01 00:10:16"),
        Some("2019-01-01 00:16:32"),
        Some("97"),
        Some("49"),
        Some("6"),
        Some("0.86"),
    ];

    #[test]
    fn category_parsing_rejects_unknown_values() {
        assert_eq!("green".parse::<Category>(), Ok(Category::Green));
        assert_eq!("yellow".parse::<Category>(), Ok(Category::Yellow));
        let err = "blue".parse::<Category>().unwrap_err();
        assert_eq!(err.value, "blue");
        assert!("Green".parse::<Category>().is_err());
        assert!("".parse::<Category>().is_err());
    }

    #[test]
    fn yellow_schema_uses_tpep_columns() {
        let schema = Category::Yellow.schema();
        assert_eq!(schema.target_table, "yellow_tripdata");
        assert_eq!(schema.staging_table, "yellow_tripdata_staging");
        assert_eq!(schema.pickup_column, "tpep_pickup_datetime");
        assert_eq!(schema.dropoff_column, "tpep_dropoff_datetime");
        assert_eq!(schema.columns.len(), 18);
        assert!(!schema.has_column("trip_type"));
        assert!(!schema.has_column("ehail_fee"));
    }

    #[test]
    fn green_schema_adds_trip_type_and_ehail_fee() {
        let schema = Category::Green.schema();
        assert_eq!(schema.target_table, "green_tripdata");
        assert_eq!(schema.pickup_column, "lpep_pickup_datetime");
        assert_eq!(schema.dropoff_column, "lpep_dropoff_datetime");
        assert_eq!(schema.columns.len(), 20);
        assert!(schema.has_column("trip_type"));
        assert!(schema.has_column("ehail_fee"));
    }

    #[test]
    fn key_columns_follow_category_timestamps() {
        let keys = Category::Green.schema().key_columns();
        assert_eq!(keys[1], "lpep_pickup_datetime");
        assert_eq!(keys[2], "lpep_dropoff_datetime");
        for schema in [&GREEN_SCHEMA, &YELLOW_SCHEMA] {
            for key in schema.key_columns() {
                assert!(schema.has_column(key), "{key} missing from {}", schema.target_table);
            }
        }
    }

    #[test]
    fn period_parses_month_and_partition_keys() {
        let p: Period = "2019-01".parse().unwrap();
        assert_eq!((p.year(), p.month()), (2019, 1));
        let p: Period = "2021-07-01".parse().unwrap();
        assert_eq!(p.to_string(), "2021-07");

        for bad in [
            "2019-13",
            "2019-00",
            "19-01",
            "2019/01",
            "2019-1",
            "2019-01-1x",
            "abcd-01",
            "2019-01-99",
            "2019-02-30",
            "2019-01-00",
            "2018-12",
        ] {
            assert!(bad.parse::<Period>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn period_from_trigger_time() {
        let at = Utc.with_ymd_and_hms(2020, 3, 1, 9, 0, 0).single().unwrap();
        assert_eq!(Period::from_datetime(&at).unwrap().to_string(), "2020-03");

        // 20:00 UTC on the last day is already the next month at UTC+7
        let late = Utc.with_ymd_and_hms(2020, 3, 31, 20, 0, 0).single().unwrap();
        let hcm = FixedOffset::east_opt(7 * 3600).unwrap();
        assert_eq!(Period::from_datetime(&late.with_timezone(&hcm)).unwrap().to_string(), "2020-04");

        let early = Utc.with_ymd_and_hms(2018, 6, 1, 0, 0, 0).single().unwrap();
        assert!(Period::from_datetime(&early).is_err());
    }

    #[test]
    fn descriptor_derives_url_filename_and_run_key() {
        let d = ExtractDescriptor::new(Category::Green, "2019-01".parse().unwrap());
        assert_eq!(d.filename(), "green_tripdata_2019-01.csv");
        assert_eq!(
            d.url("https://github.com/DataTalksClub/nyc-tlc-data/releases/download/"),
            "https://github.com/DataTalksClub/nyc-tlc-data/releases/download/green/green_tripdata_2019-01.csv.gz"
        );
        assert_eq!(d.run_key(), "green_2019_01");
    }

    #[test]
    fn row_key_is_deterministic() {
        assert_eq!(row_key(TRIP), row_key(TRIP));
        assert_eq!(row_key(TRIP).len(), 64);
    }

    #[test]
    fn row_key_changes_when_any_field_changes() {
        let base = row_key(TRIP);
        for idx in 0..KEY_FIELD_COUNT {
            let mut changed = TRIP;
            changed[idx] = Some("999");
            assert_ne!(row_key(changed), base, "field {idx} did not affect key");
        }
    }

    #[test]
    fn row_key_treats_null_as_empty_text() {
        let mut with_null = TRIP;
        with_null[0] = None;
        let mut with_empty = TRIP;
        with_empty[0] = Some("");
        assert_eq!(row_key(with_null), row_key(with_empty));
        // sha256 of the empty string: every all-null row collapses onto it
        assert_eq!(
            row_key([None; KEY_FIELD_COUNT]),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
