use entwine::adapter::{Adapter, Record};
use entwine::datatype::Raw;
use entwine::persist::{PersistenceMode, SqliteAdapter};
use entwine::parley::Engine;

fn record(pairs: &[(&str, &str)]) -> Record {
    pairs
        .iter()
        .map(|(column, value)| (column.to_string(), Raw::Text(value.to_string())))
        .collect()
}

fn find_by_id(
    engine: &Engine<SqliteAdapter>,
    table: &str,
    id: &str,
) -> Option<Record> {
    engine
        .adapter()
        .find_one(table, &vec![("id".to_string(), Raw::Text(id.to_string()))])
        .expect("find")
}

#[test]
fn single_owner_link_drop_removes_the_owned_row() {
    let source = "
Class { number:id [primary], str[50]:name, List[Student]:students }
Student (Class) { number:id [primary], str[50]:name }
";
    let adapter = SqliteAdapter::new(PersistenceMode::InMemory).expect("adapter");
    let engine = Engine::parse(source, adapter).expect("parse");
    {
        let mut adapter = engine.adapter();
        adapter
            .insert("Class", &record(&[("id", "201"), ("name", "Algebra")]))
            .expect("class");
        adapter
            .insert("Student", &record(&[("id", "201"), ("name", "Ada")]))
            .expect("student");
        adapter
            .insert(
                "class_student",
                &record(&[("class_id", "201"), ("student_id", "201")]),
            )
            .expect("link");
    }
    assert!(find_by_id(&engine, "Student", "201").is_some());

    // dropping the junction row by raw SQL reaches the same trigger
    engine
        .adapter()
        .execute_raw("delete from \"class_student\" where \"class_id\" = '201'")
        .expect("drop link");

    assert!(
        find_by_id(&engine, "Student", "201").is_none(),
        "the orphaned student must be reclaimed immediately"
    );
    assert!(
        find_by_id(&engine, "Class", "201").is_some(),
        "the owner row is untouched"
    );
}

#[test]
fn multi_owner_rows_survive_until_the_last_link_drops() {
    let source = "
Post { number:id [primary], str[100]:title, List[Tag]:tags }
User { number:id [primary], str[50]:name, List[Tag]:tags }
Tag (Post, User) { number:id [primary], str[30]:label }
";
    let adapter = SqliteAdapter::new(PersistenceMode::InMemory).expect("adapter");
    let engine = Engine::parse(source, adapter).expect("parse");
    {
        let mut adapter = engine.adapter();
        adapter
            .insert("Post", &record(&[("id", "301"), ("title", "Hello")]))
            .expect("post");
        adapter
            .insert("User", &record(&[("id", "301"), ("name", "Casey")]))
            .expect("user");
        adapter
            .insert("Tag", &record(&[("id", "301"), ("label", "intro")]))
            .expect("tag");
        adapter
            .insert("post_tag", &record(&[("post_id", "301"), ("tag_id", "301")]))
            .expect("post link");
        adapter
            .insert("tag_user", &record(&[("tag_id", "301"), ("user_id", "301")]))
            .expect("user link");
    }

    // one of two owner links dropped: the tag stays
    engine
        .adapter()
        .execute_raw("delete from \"post_tag\" where \"tag_id\" = '301'")
        .expect("drop post link");
    assert!(
        find_by_id(&engine, "Tag", "301").is_some(),
        "a tag with a remaining owner link must survive"
    );

    // the last link dropped: the tag goes
    engine
        .adapter()
        .execute_raw("delete from \"tag_user\" where \"tag_id\" = '301'")
        .expect("drop user link");
    assert!(
        find_by_id(&engine, "Tag", "301").is_none(),
        "the tag must be reclaimed with its last owner link"
    );

    // no collateral damage
    assert!(find_by_id(&engine, "Post", "301").is_some());
    assert!(find_by_id(&engine, "User", "301").is_some());
}

#[test]
fn deleting_an_unrelated_link_leaves_other_owned_rows_alone() {
    let source = "
Class { number:id [primary], str[50]:name, List[Student]:students }
Student (Class) { number:id [primary], str[50]:name }
";
    let adapter = SqliteAdapter::new(PersistenceMode::InMemory).expect("adapter");
    let engine = Engine::parse(source, adapter).expect("parse");
    {
        let mut adapter = engine.adapter();
        adapter
            .insert("Class", &record(&[("id", "1"), ("name", "Algebra")]))
            .expect("class");
        adapter
            .insert("Student", &record(&[("id", "10"), ("name", "Ada")]))
            .expect("student 10");
        adapter
            .insert("Student", &record(&[("id", "11"), ("name", "Brian")]))
            .expect("student 11");
        adapter
            .insert(
                "class_student",
                &record(&[("class_id", "1"), ("student_id", "10")]),
            )
            .expect("link 10");
        adapter
            .insert(
                "class_student",
                &record(&[("class_id", "1"), ("student_id", "11")]),
            )
            .expect("link 11");
    }

    engine
        .adapter()
        .execute_raw("delete from \"class_student\" where \"student_id\" = '10'")
        .expect("drop one link");

    assert!(find_by_id(&engine, "Student", "10").is_none());
    assert!(
        find_by_id(&engine, "Student", "11").is_some(),
        "rows with intact links are not affected"
    );
}
