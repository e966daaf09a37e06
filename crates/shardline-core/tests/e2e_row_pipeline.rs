//! End-to-end tests for the read-side data path
//!
//! Manifest schema → encoded row → typed values → merged response, as one
//! lookup across two tables would produce it.

use shardline_core::codec::{column_count, RowEncoder};
use shardline_core::value::row_values;
use shardline_core::{FeatureValue, JsonMergeOperator, Manifest, MapMergeOperator, MergeOperator};

fn profile_manifest() -> Manifest {
    Manifest::from_slice(
        br#"{
            "name": "profile",
            "partitions": ["0.db", "1.db"],
            "version": "v3",
            "key_column": "uid",
            "features": {
                "uid": {"data_type": "string", "store_type": "text"},
                "age": {"data_type": "int64", "store_type": "integer"},
                "city": {"data_type": "string", "store_type": "text"},
                "ctr": {"data_type": "float32", "store_type": "real"},
                "interests": {"data_type": "int64_list", "store_type": "text", "separator": "|"}
            }
        }"#,
    )
    .unwrap()
}

fn behavior_manifest() -> Manifest {
    Manifest::from_slice(
        br#"{
            "name": "behavior",
            "partitions": ["0.db"],
            "version": "v9",
            "key_column": "uid",
            "features": {
                "clicks": {"data_type": "int64", "store_type": "integer"},
                "last_items": {"data_type": "string_list", "store_type": "text"}
            }
        }"#,
    )
    .unwrap()
}

#[test]
fn test_e2e_schema_to_merged_json() {
    // Given: encoded rows laid out in each manifest's column order
    let profile = profile_manifest();
    let columns = profile.columns();
    let names: Vec<_> = columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["age", "city", "ctr", "interests"]);

    let mut row = RowEncoder::new(columns.len()).unwrap();
    row.push_int64(31).unwrap();
    row.push_bytes(b"berlin").unwrap();
    row.push_float32(0.25).unwrap();
    row.push_bytes(b"3|17||42").unwrap();
    let profile_row = row.finish().unwrap();
    assert_eq!(column_count(&profile_row).unwrap(), 4);

    let behavior = behavior_manifest();
    let mut row = RowEncoder::new(2).unwrap();
    row.push_none().unwrap();
    row.push_bytes(br#"["a","b"]"#).unwrap();
    let behavior_row = row.finish().unwrap();

    // When: both rows are decoded and merged
    let profile_values = row_values(&profile_row, &columns).unwrap();
    let behavior_values = row_values(&behavior_row, &behavior.columns()).unwrap();

    assert_eq!(profile_values["interests"], FeatureValue::ArrayInt(vec![3, 17, 42]));
    assert_eq!(behavior_values["clicks"], FeatureValue::Null);

    let op = JsonMergeOperator;
    let merged = op
        .merge_all([
            op.fragment("profile", &profile_values).unwrap(),
            op.fragment("behavior", &behavior_values).unwrap(),
        ])
        .unwrap();

    // Then: one flat JSON object with every column
    let json: serde_json::Value =
        serde_json::from_slice(&JsonMergeOperator::wrap(&merged)).unwrap();
    assert_eq!(json["age"], 31);
    assert_eq!(json["city"], "berlin");
    assert_eq!(json["ctr"], 0.25);
    assert_eq!(json["interests"], serde_json::json!([3, 17, 42]));
    assert_eq!(json["clicks"], serde_json::Value::Null);
    assert_eq!(json["last_items"], serde_json::json!(["a", "b"]));
}

#[test]
fn test_e2e_merge_order_does_not_change_result() {
    let profile = profile_manifest();
    let mut row = RowEncoder::new(4).unwrap();
    row.push_int64(7).unwrap();
    row.push_none().unwrap();
    row.push_none().unwrap();
    row.push_none().unwrap();
    let values_a = row_values(&row.finish().unwrap(), &profile.columns()).unwrap();

    let mut row = RowEncoder::new(2).unwrap();
    row.push_int64(5).unwrap();
    row.push_none().unwrap();
    let values_b = row_values(&row.finish().unwrap(), &behavior_manifest().columns()).unwrap();

    let op = MapMergeOperator;
    let forward = op
        .merge_all([
            op.fragment("profile", &values_a).unwrap(),
            op.fragment("behavior", &values_b).unwrap(),
        ])
        .unwrap();
    let backward = op
        .merge_all([
            op.fragment("behavior", &values_b).unwrap(),
            op.fragment("profile", &values_a).unwrap(),
        ])
        .unwrap();
    assert_eq!(forward, backward);
    assert_eq!(forward["profile/age"], FeatureValue::Int(7));
    assert_eq!(forward["behavior/clicks"], FeatureValue::Int(5));
}

#[test]
fn test_e2e_row_from_other_schema_is_rejected() {
    // A row built for one table never decodes against another's schema
    let mut row = RowEncoder::new(2).unwrap();
    row.push_int64(1).unwrap();
    row.push_int64(2).unwrap();
    let buf = row.finish().unwrap();
    assert!(row_values(&buf, &profile_manifest().columns()).is_err());
}
