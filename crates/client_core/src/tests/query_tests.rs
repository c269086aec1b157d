use super::*;
use serde_json::json;

fn fields(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

fn people() -> Vec<Value> {
    vec![
        json!({"id": 1, "name": "Carla", "team": "blue", "score": 7}),
        json!({"id": 2, "name": "bob", "team": "red", "score": 3}),
        json!({"id": 3, "name": "Alma", "team": "red", "score": 7}),
        json!({"id": 4, "name": "Dan", "team": "green", "score": 1}),
    ]
}

fn ids(rows: &[Value]) -> Vec<i64> {
    rows.iter().map(|row| row["id"].as_i64().expect("id")).collect()
}

#[test]
fn sort_toggles_on_same_field_and_resets_on_new_field() {
    let query = CollectionQuery::new(10).with_page(3);

    let by_name = query.with_sort("name", None);
    assert_eq!(by_name.sort_direction, SortDirection::Asc);
    assert_eq!(by_name.page_index, 0);

    let flipped = by_name.with_sort("name", None);
    assert_eq!(flipped.sort_direction, SortDirection::Desc);

    let other = flipped.with_sort("score", None);
    assert_eq!(other.sort_direction, SortDirection::Asc);

    let explicit = other.with_sort("score", Some(SortDirection::Asc));
    assert_eq!(explicit.sort_direction, SortDirection::Asc);
}

#[test]
fn search_and_page_size_changes_return_to_first_page() {
    let query = CollectionQuery::new(10).with_page(4);
    assert_eq!(query.with_search("x").page_index, 0);
    assert_eq!(query.with_page_size(25).page_index, 0);
    assert_eq!(query.with_page_size(0).page_size, 1);
    assert_eq!(query.offset(), 40);
}

#[test]
fn client_plan_filters_case_insensitively_across_declared_fields() {
    let query = CollectionQuery::new(10).with_search("RE");
    let plan = client_plan(&query, &fields(&["name", "team"]));
    let window = plan.apply(&people());
    assert_eq!(ids(&window.items), vec![2, 3, 4]);
    assert_eq!(window.total, 3);
    assert!(!window.has_more);

    let name_only = client_plan(&query, &fields(&["name"]));
    assert!(name_only.apply(&people()).items.is_empty());
}

#[test]
fn client_sort_is_stable_in_both_directions() {
    let asc = CollectionQuery::new(10).with_sort("score", Some(SortDirection::Asc));
    let window = client_plan(&asc, &[]).apply(&people());
    assert_eq!(ids(&window.items), vec![4, 2, 1, 3]);

    let desc = asc.with_sort("score", Some(SortDirection::Desc));
    let window = client_plan(&desc, &[]).apply(&people());
    // ids 1 and 3 tie on score and keep their source order.
    assert_eq!(ids(&window.items), vec![1, 3, 2, 4]);
}

#[test]
fn client_window_is_cumulative_up_to_current_page() {
    let rows: Vec<Value> = (0..25).map(|id| json!({"id": id})).collect();
    let query = CollectionQuery::new(10).with_page(1);
    let plan = client_plan(&query, &[]);
    assert_eq!(plan.end(), 20);

    let window = plan.apply(&rows);
    assert_eq!(window.items.len(), 20);
    assert_eq!(ids(&window.items[..2]), vec![0, 1]);
    assert!(window.has_more);

    let last = client_plan(&query.with_page(2), &[]).apply(&rows);
    assert_eq!(last.items.len(), 25);
    assert!(!last.has_more);
}

#[test]
fn out_of_range_page_index_saturates() {
    let query = CollectionQuery::new(10).with_page(usize::MAX);
    assert_eq!(query.offset(), usize::MAX);
    assert_eq!(client_plan(&query, &[]).end(), usize::MAX);

    let rows: Vec<Value> = (0..3).map(|id| json!({"id": id})).collect();
    let window = client_plan(&query, &[]).apply(&rows);
    assert_eq!(window.items.len(), 3);
    assert!(!window.has_more);
    assert_eq!(
        remote_request(&query, None).param("skip"),
        Some(usize::MAX.to_string().as_str())
    );
}

#[test]
fn remote_request_uses_default_parameter_names() {
    let query = CollectionQuery::new(20).with_search("ada").with_page(2);
    let request = remote_request(&query, None);
    assert_eq!(request.param("search"), Some("ada"));
    assert_eq!(request.param("limit"), Some("20"));
    assert_eq!(request.param("skip"), Some("40"));

    let unfiltered = remote_request(&CollectionQuery::new(5), None);
    assert_eq!(unfiltered.param("search"), None);
    assert_eq!(unfiltered.param("skip"), Some("0"));
}

#[test]
fn custom_param_builder_overrides_defaults() {
    let builder: ParamBuilder = Arc::new(|query: &CollectionQuery| {
        vec![
            ("q".to_string(), query.search_text.clone()),
            ("page".to_string(), (query.page_index + 1).to_string()),
            (
                "order".to_string(),
                query.sort_direction.as_str().to_string(),
            ),
        ]
    });
    let query = CollectionQuery::new(10).with_page(1);
    let Plan::Remote(request) = normalize(
        &query,
        NormalizeMode::Remote {
            param_builder: Some(&builder),
        },
    ) else {
        panic!("expected remote plan");
    };

    assert_eq!(request.param("limit"), None);
    assert_eq!(request.param("skip"), None);
    // Empty search is dropped, like any other empty value.
    assert_eq!(request.param("q"), None);
    assert_eq!(request.param("page"), Some("2"));
    assert_eq!(request.param("order"), Some("ASC"));
}

#[test]
fn json_rows_expose_keys_and_fields() {
    let row = json!({"id": 7, "slug": "seven", "ratio": 0.5, "tags": ["a"]});
    assert_eq!(row_key(&row, "id"), Some(RowKey::Int(7)));
    assert_eq!(row_key(&row, "slug"), Some(RowKey::from("seven")));
    assert_eq!(row_key(&row, "missing"), None);
    assert_eq!(row.field("ratio"), Some(FieldValue::Number(0.5)));
    assert!(row
        .field("tags")
        .is_some_and(|value| value.contains_lowercase("\"a\"")));
}
