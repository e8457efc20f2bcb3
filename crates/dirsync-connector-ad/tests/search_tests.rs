//! Integration tests for search: paging, sorting, filters and replicas.

mod common;

use common::*;
use dirsync_connector::prelude::*;
use dirsync_connector_ad::directory::{Paging, RawEntry};

/// Tests that the first page of a VLV search holds `page_size` records in
/// ascending order with an advisory count of what is left.
#[test]
fn test_first_page_reports_remaining() {
    let (directory, connector) = setup();
    seed_accounts(&directory, 25);

    let options = OperationOptions::new()
        .with_page_size(10)
        .with_paged_results_offset(1)
        .with_sort_key(SortKey::ascending("cn"));
    let (objects, summary) = search_all(&connector, &ObjectClass::Account, None, &options).unwrap();

    let names: Vec<&str> = objects.iter().map(|o| o.name()).collect();
    let expected: Vec<String> = (0..10).map(|i| user_dn(&format!("user{i:02}"))).collect();
    assert_eq!(names, expected);
    assert_eq!(summary.remaining_paged_results, Some(15));
}

/// Tests that a later offset returns the next window.
#[test]
fn test_second_page() {
    let (directory, connector) = setup();
    seed_accounts(&directory, 25);

    let options = OperationOptions::new()
        .with_page_size(10)
        .with_paged_results_offset(11)
        .with_sort_key(SortKey::ascending("cn"));
    let (objects, summary) = search_all(&connector, &ObjectClass::Account, None, &options).unwrap();

    assert_eq!(objects.len(), 10);
    assert_eq!(objects[0].name(), user_dn("user10"));
    assert_eq!(objects[9].name(), user_dn("user19"));
    assert_eq!(summary.remaining_paged_results, Some(5));
}

/// Tests that paging without an offset starts at 1 and always sends a sort key.
#[test]
fn test_paging_defaults_offset_and_sort() {
    let (directory, connector) = setup();
    seed_accounts(&directory, 3);

    let options = OperationOptions::new().with_page_size(2);
    let (objects, summary) = search_all(&connector, &ObjectClass::Account, None, &options).unwrap();
    assert_eq!(objects.len(), 2);
    assert_eq!(summary.diagnostics.len(), 1);

    let query = directory.queries().pop().unwrap();
    assert_eq!(query.sort, Some(SortKey::ascending("cn")));
    assert_eq!(
        query.paging,
        Paging::Vlv {
            before: 0,
            after: 1,
            offset: 1
        }
    );
}

/// Tests that offset 0 is refused before the directory is contacted.
#[test]
fn test_offset_zero_is_a_usage_error() {
    let (directory, connector) = setup();
    seed_accounts(&directory, 3);
    let opened = directory.connections_opened();
    let operations = directory.operation_count();

    let options = OperationOptions::new()
        .with_page_size(10)
        .with_paged_results_offset(0);
    let err = search_all(&connector, &ObjectClass::Account, None, &options).unwrap_err();

    assert_eq!(err.error_code(), "INVALID_USAGE");
    assert_eq!(directory.connections_opened(), opened);
    assert_eq!(directory.operation_count(), operations);
}

/// Tests that unpaged searches fetch everything in internal chunks.
#[test]
fn test_unpaged_search_returns_everything() {
    let (directory, connector) = setup();
    seed_accounts(&directory, 12);

    let (objects, summary) =
        search_all(&connector, &ObjectClass::Account, None, &OperationOptions::new()).unwrap();
    assert_eq!(objects.len(), 12);
    assert_eq!(summary.remaining_paged_results, None);
    assert!(matches!(
        directory.queries().pop().unwrap().paging,
        Paging::Chunked { size: 1000 }
    ));
}

/// Tests structured filters and the legacy raw filter options.
#[test]
fn test_filters() {
    let (directory, connector) = setup();
    seed_accounts(&directory, 5);

    let filter = Filter::eq("sAMAccountName", "user03");
    let (objects, summary) =
        search_all(&connector, &ObjectClass::Account, Some(&filter), &OperationOptions::new())
            .unwrap();
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].name(), user_dn("user03"));
    assert!(summary.diagnostics.is_empty());

    let legacy = OperationOptions::new().with_option("searchFilter", "sAMAccountName=user04");
    let (objects, summary) =
        search_all(&connector, &ObjectClass::Account, None, &legacy).unwrap();
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].name(), user_dn("user04"));
    assert_eq!(summary.diagnostics.len(), 1);

    let malformed = OperationOptions::new().with_option("Search Filter String", "(cn=");
    let err = search_all(&connector, &ObjectClass::Account, None, &malformed).unwrap_err();
    assert!(err.is_caller_error());
}

/// Tests that requested attributes come back typed and nothing else does.
#[test]
fn test_attributes_to_get() {
    let (directory, connector) = setup();
    seed_accounts(&directory, 1);

    let options = OperationOptions::new().with_attributes_to_get([
        "sAMAccountName",
        "userAccountControl",
        ENABLE_ATTRIBUTE,
        "ad_container",
        "title",
    ]);
    let (objects, _) = search_all(&connector, &ObjectClass::Account, None, &options).unwrap();
    let attributes = objects[0].attributes();

    assert_eq!(attributes.get_string("sAMAccountName"), Some("user00"));
    assert_eq!(
        attributes.get("userAccountControl"),
        Some(&AttributeValue::Integer(512))
    );
    assert_eq!(
        attributes.get(ENABLE_ATTRIBUTE),
        Some(&AttributeValue::Boolean(true))
    );
    assert_eq!(attributes.get_string("ad_container"), Some(users().as_str()));
    assert!(!attributes.has("title"));
    assert!(!attributes.has("givenName"));
    assert!(objects[0].uid().value().starts_with("<GUID="));
}

/// Tests that one sort key is honored and two are refused.
#[test]
fn test_sort_keys() {
    let (directory, connector) = setup();
    seed_accounts(&directory, 4);

    let options = OperationOptions::new().with_sort_key(SortKey::descending("cn"));
    let (objects, _) = search_all(&connector, &ObjectClass::Account, None, &options).unwrap();
    assert_eq!(objects[0].name(), user_dn("user03"));
    assert_eq!(objects[3].name(), user_dn("user00"));

    let options = options.with_sort_key(SortKey::ascending("sn"));
    let err = search_all(&connector, &ObjectClass::Account, None, &options).unwrap_err();
    assert!(err.is_caller_error());
}

/// Tests that a handler returning false ends the search without error and
/// without leaking the result set.
#[test]
fn test_handler_can_stop_early() {
    let (directory, connector) = setup();
    seed_accounts(&directory, 10);

    let mut seen = 0;
    connector
        .search(
            &ObjectClass::Account,
            None,
            &mut |_| {
                seen += 1;
                seen < 3
            },
            &OperationOptions::new(),
        )
        .unwrap();
    assert_eq!(seen, 3);
    assert_eq!(directory.open_result_sets(), 0);
    // Only the persistent connection stays open.
    assert_eq!(directory.open_connections(), 1);
}

/// Tests that searches outside the default container get their own
/// connection, which is closed afterwards.
#[test]
fn test_container_override_uses_scoped_connection() {
    let (directory, connector) = setup();
    directory
        .insert(RawEntry::new(format!("OU=Sales,{ROOT}")).with("objectClass", "organizationalUnit"))
        .unwrap();
    directory
        .insert(
            RawEntry::new(format!("CN=seller,OU=Sales,{ROOT}"))
                .with("objectClass", "user")
                .with("sAMAccountName", "seller"),
        )
        .unwrap();
    seed_accounts(&directory, 2);
    let opened = directory.connections_opened();

    let options = OperationOptions::new().with_container(format!("OU=Sales,{ROOT}"));
    let (objects, _) = search_all(&connector, &ObjectClass::Account, None, &options).unwrap();
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].name(), format!("CN=seller,OU=Sales,{ROOT}"));
    assert_eq!(directory.connections_opened(), opened + 1);
    assert_eq!(directory.open_connections(), 1);

    search_all(&connector, &ObjectClass::Account, None, &OperationOptions::new()).unwrap();
    assert_eq!(directory.connections_opened(), opened + 1);
}

/// Tests scope options.
#[test]
fn test_scope_option() {
    let (directory, connector) = setup();
    seed_accounts(&directory, 2);

    let base = OperationOptions::new()
        .with_container(user_dn("user01"))
        .with_scope("object");
    let (objects, _) = search_all(&connector, &ObjectClass::Account, None, &base).unwrap();
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].name(), user_dn("user01"));

    let bad = OperationOptions::new().with_scope("sideways");
    assert!(search_all(&connector, &ObjectClass::Account, None, &bad)
        .unwrap_err()
        .is_caller_error());
}

/// Tests that a missing search root is reported as not found.
#[test]
fn test_missing_container() {
    let (_directory, connector) = setup();
    let options = OperationOptions::new().with_container(format!("OU=Gone,{ROOT}"));
    let err = search_all(&connector, &ObjectClass::Account, None, &options).unwrap_err();
    assert_eq!(err.error_code(), "OBJECT_NOT_FOUND");
}

/// Tests that global catalog results are completed from a domain controller,
/// and that entries only the replica knows fall back to its copy.
#[test]
fn test_global_catalog_search() {
    let directory = memory_directory();
    directory.set_partial_attribute_set(&["sAMAccountName", "cn"]);
    directory
        .insert(account_entry("jdoe").with("title", "Engineer"))
        .unwrap();
    directory.insert_replica_only(
        RawEntry::new(format!("CN=child,CN=Users,DC=east,{ROOT}"))
            .with("objectClass", "user")
            .with("objectCategory", format!("CN=Person,CN=Schema,CN=Configuration,{ROOT}").as_str())
            .with("sAMAccountName", "child")
            .with("title", "Stale"),
    );
    let connector = connect(&directory, test_config().with_child_domains());

    let options = OperationOptions::new()
        .with_container(ROOT)
        .with_attributes_to_get(["sAMAccountName", "title"])
        .with_sort_key(SortKey::ascending("sAMAccountName"));
    let (objects, _) = search_all(&connector, &ObjectClass::Account, None, &options).unwrap();

    assert_eq!(objects.len(), 2);
    assert_eq!(objects[0].attributes().get_string("sAMAccountName"), Some("child"));
    assert_eq!(objects[0].attributes().get_string("title"), Some("Stale"));
    assert_eq!(objects[1].attributes().get_string("title"), Some("Engineer"));
    assert_eq!(directory.open_connections(), 1);
}

/// Tests that an entry the domain controller cannot read is skipped while the
/// rest of the search still arrives.
#[test]
fn test_unreadable_entry_is_skipped() {
    let directory = memory_directory();
    seed_accounts(&directory, 3);
    directory.fail_reads_for(&user_dn("user01"));
    let connector = connect(&directory, test_config().with_child_domains());

    let options = OperationOptions::new()
        .with_container(ROOT)
        .with_attributes_to_get(["sAMAccountName"])
        .with_sort_key(SortKey::ascending("sAMAccountName"));
    let (objects, summary) = search_all(&connector, &ObjectClass::Account, None, &options).unwrap();

    let names: Vec<_> = objects
        .iter()
        .filter_map(|o| o.attributes().get_string("sAMAccountName"))
        .collect();
    assert_eq!(names, vec!["user00", "user02"]);
    assert_eq!(summary.skipped, 1);
    assert_eq!(directory.open_result_sets(), 0);
    assert_eq!(directory.open_connections(), 1);
}

/// Tests that tombstones are only returned when asked for, and carry nothing
/// but identifier, name and `uSNChanged`.
#[test]
fn test_tombstones() {
    let (directory, connector) = setup();
    seed_accounts(&directory, 2);

    let (live, _) =
        search_all(&connector, &ObjectClass::Account, None, &OperationOptions::new()).unwrap();
    let doomed = live[0].uid().clone();
    connector
        .delete(&ObjectClass::Account, &doomed, &OperationOptions::new())
        .unwrap();

    let options = OperationOptions::new()
        .with_container(ROOT)
        .with_include_tombstones(true);
    let (objects, _) = search_all(&connector, &ObjectClass::Account, None, &options).unwrap();
    let tombstone = objects.iter().find(|o| o.is_deleted()).unwrap();

    assert_eq!(tombstone.uid(), &doomed);
    assert!(!tombstone.name().is_empty());
    let names: Vec<&str> = tombstone.attributes().names().collect();
    assert_eq!(names, vec!["uSNChanged"]);
    assert_eq!(objects.iter().filter(|o| !o.is_deleted()).count(), 1);
}
