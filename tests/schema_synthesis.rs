use entwine::adapter::Adapter;
use entwine::datatype::Raw;
use entwine::error::EntwineError;
use entwine::parley::Engine;
use entwine::persist::{PersistenceMode, SqliteAdapter};

const SOURCE: &str = "
// courses and their students
Class { number:id [primary], str[50]:name, List[Student]:students }
Student (Class) { number:id [primary], str[50]:name [not null], bool:active }

Enroll(number:class_id, number:student_id):
    Get the Class by id of {class_id} as class
    return {class}
";

fn parse_in_memory(source: &str) -> Result<Engine<SqliteAdapter>, EntwineError> {
    let adapter = SqliteAdapter::new(PersistenceMode::InMemory)?;
    Engine::parse(source, adapter)
}

#[test]
fn parsing_twice_against_the_same_store_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("school.db").to_string_lossy().into_owned();

    let adapter = SqliteAdapter::new(PersistenceMode::File(path.clone())).expect("adapter");
    let engine = Engine::parse(SOURCE, adapter).expect("first parse");
    engine.close().expect("close");

    // same source, previously synthesized store: tables, junctions and
    // triggers are all re-ensured without error
    let adapter = SqliteAdapter::new(PersistenceMode::File(path)).expect("adapter");
    let engine = Engine::parse(SOURCE, adapter).expect("second parse");

    let triggers = engine
        .adapter()
        .find(
            "sqlite_master",
            &vec![("type".to_string(), Raw::Text("trigger".to_string()))],
        )
        .expect("catalog");
    assert_eq!(triggers.len(), 1, "exactly one orphan trigger");
    assert_eq!(
        triggers[0]["name"],
        Raw::Text("auto_gc_student_from_class_student".to_string())
    );
}

#[test]
fn synthesized_objects_follow_the_naming_scheme() {
    let engine = parse_in_memory(SOURCE).expect("parse");
    let adapter = engine.adapter();
    let tables = adapter
        .find(
            "sqlite_master",
            &vec![("type".to_string(), Raw::Text("table".to_string()))],
        )
        .expect("catalog");
    let names: Vec<&str> = tables
        .iter()
        .filter_map(|row| match row.get("name") {
            Some(Raw::Text(name)) => Some(name.as_str()),
            _ => None,
        })
        .collect();
    assert!(names.contains(&"Class"), "entity tables keep their case");
    assert!(names.contains(&"Student"));
    assert!(
        names.contains(&"class_student"),
        "junctions are lowercased and lex-ordered"
    );

    let indexes = adapter
        .find(
            "sqlite_master",
            &vec![("type".to_string(), Raw::Text("index".to_string()))],
        )
        .expect("catalog");
    let index_names: Vec<&str> = indexes
        .iter()
        .filter_map(|row| match row.get("name") {
            Some(Raw::Text(name)) => Some(name.as_str()),
            _ => None,
        })
        .collect();
    assert!(index_names.contains(&"idx_class_student_class_id"));
    assert!(index_names.contains(&"idx_class_student_student_id"));
}

#[test]
fn an_unknown_relation_target_is_a_schema_error() {
    let source = "
User { number:id [primary], List[Ghost]:ghosts }
";
    let err = parse_in_memory(source).unwrap_err();
    assert!(matches!(err, EntwineError::Schema(_)), "got: {err}");
}

#[test]
fn an_unknown_owner_is_a_schema_error() {
    let source = "
Pet (Owner) { number:id [primary] }
";
    let err = parse_in_memory(source).unwrap_err();
    assert!(matches!(err, EntwineError::Schema(_)));
}

#[test]
fn a_duplicate_entity_name_is_a_schema_error() {
    let source = "
Item { number:id [primary] }
Item { number:id [primary] }
";
    let err = parse_in_memory(source).unwrap_err();
    assert!(matches!(err, EntwineError::Schema(_)));
}

#[test]
fn two_primary_fields_are_a_schema_error() {
    let source = "
Item { number:id [primary], number:serial [primary] }
";
    let err = parse_in_memory(source).unwrap_err();
    assert!(matches!(err, EntwineError::Schema(_)));
}

#[test]
fn a_related_entity_without_a_primary_key_is_a_schema_error() {
    let source = "
Box { number:id [primary], List[Marble]:marbles }
Marble { str[10]:color }
";
    let err = parse_in_memory(source).unwrap_err();
    assert!(matches!(err, EntwineError::Schema(_)));
}

#[test]
fn a_malformed_field_declaration_is_a_schema_error() {
    let source = "
Item { number id [primary] }
";
    let err = parse_in_memory(source).unwrap_err();
    assert!(matches!(err, EntwineError::Schema(_)));
}

#[test]
fn an_unrecognized_top_level_line_is_a_schema_error() {
    let source = "
Item { number:id [primary] }
this line belongs to nothing
";
    let err = parse_in_memory(source).unwrap_err();
    assert!(matches!(err, EntwineError::Schema(_)));
}

#[test]
fn parse_errors_surface_before_any_table_exists() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("untouched.db").to_string_lossy().into_owned();

    let source = "
Item { number:id [primary], List[Ghost]:ghosts }
";
    let adapter = SqliteAdapter::new(PersistenceMode::File(path.clone())).expect("adapter");
    assert!(Engine::parse(source, adapter).is_err());

    // validation failed, so synthesis never ran
    let adapter = SqliteAdapter::new(PersistenceMode::File(path)).expect("adapter");
    let tables = adapter
        .find(
            "sqlite_master",
            &vec![("type".to_string(), Raw::Text("table".to_string()))],
        )
        .expect("catalog");
    assert!(
        tables.is_empty(),
        "no table may exist after a failed parse: {tables:?}"
    );
}

#[test]
fn comments_and_blank_lines_are_ignored_everywhere() {
    let source = "
# a comment above the schema
Item { number:id [primary] }

// a comment between blocks

Fetch(number:id):
    # a comment inside a body
    Get the Item by id of {id} as item
    return {item}
";
    let engine = parse_in_memory(source).expect("parse");
    assert_eq!(engine.procedures(), vec!["Fetch"]);
}

#[test]
fn unclosed_entity_bodies_are_rejected() {
    let source = "
Item { number:id [primary]
";
    let err = parse_in_memory(source).unwrap_err();
    assert!(matches!(err, EntwineError::Schema(_)));
}
