//! End-to-end query construction: LogchefQL translation, SQL validation
//! and rewriting, template substitution, and histogram assembly.

use chrono::{TimeZone, Utc};
use logchef::histogram::{build_histogram_sql, parse_window};
use logchef::logchefql;
use logchef::models::{Column, Schema};
use logchef::sql::{self, QueryMode, TemplateVar, VarType};

fn schema(cols: &[(&str, &str)]) -> Schema {
    Schema {
        columns: cols
            .iter()
            .map(|(name, column_type)| Column {
                name: name.to_string(),
                column_type: column_type.to_string(),
            })
            .collect(),
        ..Default::default()
    }
}

#[test]
fn filter_expression_becomes_full_select() {
    let translated = logchefql::translate(r#"level="error" and service="api""#, None).unwrap();
    let sql = logchefql::build_full_query(&logchefql::FullQueryParams {
        database: "logs",
        table: "events",
        timestamp_field: "ts",
        start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        end: Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap(),
        timezone: "UTC",
        limit: 500,
        condition: &translated.sql,
    })
    .unwrap();
    assert_eq!(
        sql,
        "SELECT * FROM `logs`.`events` WHERE `ts` BETWEEN \
         toDateTime('2024-01-01 00:00:00','UTC') AND toDateTime('2024-01-01 01:00:00','UTC') \
         AND (`level`='error' AND `service`='api') ORDER BY `ts` DESC LIMIT 500"
    );
}

#[test]
fn validation_does_not_need_a_schema_but_translation_uses_one() {
    let query = r#"unknown_field="x""#;
    assert!(logchefql::validate(query).is_ok());
    let bound = schema(&[("level", "String")]);
    assert!(logchefql::translate(query, Some(&bound)).is_err());
}

#[test]
fn translation_is_deterministic_across_calls() {
    let query = r#"(a=1 or b=2) and c~"^x""#;
    let first = logchefql::translate(query, None).unwrap();
    let second = logchefql::translate(query, None).unwrap();
    assert_eq!(first.sql, second.sql);
    assert_eq!(first.conditions, second.conditions);
    assert_eq!(first.fields_used, second.fields_used);
}

#[test]
fn user_limit_replaces_any_existing_limit() {
    let rewritten = sql::build_raw_query(
        "SELECT host FROM logs.events LIMIT 100000",
        1000,
        QueryMode::Extended,
        None,
    )
    .unwrap();
    assert!(rewritten.ends_with("LIMIT 1000"), "got: {rewritten}");
}

#[test]
fn join_is_rejected_for_pinned_tables() {
    let err = sql::build_raw_query(
        "SELECT * FROM logs.events a JOIN logs.events b ON a.id = b.id",
        100,
        QueryMode::Restricted,
        Some("logs.events"),
    )
    .unwrap_err();
    assert!(err.to_string().contains("JOIN"));
}

#[test]
fn timestamp_injection_feeds_the_histogram() {
    let with_ts = sql::ensure_timestamp_in_select(
        "SELECT host, status FROM logs.nginx WHERE status = 200",
        "parsed_timestamp",
    )
    .unwrap();
    assert!(with_ts.starts_with("SELECT `parsed_timestamp`, host, status"));

    // applying it twice changes nothing
    assert_eq!(
        sql::ensure_timestamp_in_select(&with_ts, "parsed_timestamp").unwrap(),
        with_ts
    );

    let (count, unit, _) = parse_window("5m").unwrap();
    let tz = "UTC".parse().unwrap();
    let outer = build_histogram_sql(&with_ts, "parsed_timestamp", count, unit, &tz, None);
    assert!(outer.contains("toStartOfInterval(`parsed_timestamp`, INTERVAL 5 MINUTE, 'UTC') AS bucket"));
    assert!(outer.contains("count() AS log_count"));
}

#[test]
fn limit_rewrites_commute_with_limit_removal() {
    let original = "SELECT host FROM logs.events WHERE status = 500 LIMIT 42";
    let rebuilt = sql::build_raw_query(original, 7, QueryMode::Extended, None).unwrap();
    assert_eq!(
        sql::remove_limit(&rebuilt).unwrap(),
        sql::remove_limit(original).unwrap()
    );
}

#[test]
fn template_variables_expand_before_parsing() {
    let raw = "SELECT {{col}} FROM logs.events WHERE level = {{lvl}} LIMIT 5";
    let substituted = sql::substitute(
        raw,
        &[
            TemplateVar {
                name: "col".into(),
                var_type: VarType::Identifier,
                value: serde_json::json!("host"),
            },
            TemplateVar {
                name: "lvl".into(),
                var_type: VarType::String,
                value: serde_json::json!("error"),
            },
        ],
    )
    .unwrap();
    assert_eq!(
        substituted,
        "SELECT `host` FROM logs.events WHERE level = 'error' LIMIT 5"
    );
    // the substituted text is valid SQL for the builder
    assert!(sql::build_raw_query(&substituted, 10, QueryMode::Extended, None).is_ok());
}

#[test]
fn map_and_json_access_through_the_schema() {
    let bound = schema(&[
        ("labels", "Map(String, String)"),
        ("payload", "String"),
        ("ts", "DateTime"),
    ]);
    let translated =
        logchefql::translate(r#"labels.zone="eu" payload.attempts>2"#, Some(&bound)).unwrap();
    assert_eq!(
        translated.sql,
        "`labels`['zone']='eu' AND JSONExtractFloat(`payload`, 'attempts')>2"
    );
    assert_eq!(translated.fields_used, vec!["labels", "payload"]);
}

#[test]
fn logsql_translation_matches_filter_semantics() {
    let translated = logchefql::translate_to_logsql(
        r#"level="error" and (host="web-1" or host="web-2") trace_id exists"#,
        None,
    )
    .unwrap();
    assert_eq!(
        translated.sql,
        r#"level:="error" AND (host:="web-1" OR host:="web-2") AND trace_id:*"#
    );
}
