use entwine::adapter::{Adapter, JunctionLayout, Record};
use entwine::datatype::Raw;
use entwine::parley::{Argument, Arguments, Engine};
use entwine::persist::{PersistenceMode, SqliteAdapter};

const SOURCE: &str = "
User { number:id [primary], str[50]:name, List[Post]:posts }
Post { number:id [primary], str[100]:title }

GetUser(number:id):
    Get the User by id of {id} as user
    return {user}

GetUserPosts(number:id):
    Get the User by id of {id} as user
    return {user.posts}
";

fn record(pairs: &[(&str, &str)]) -> Record {
    pairs
        .iter()
        .map(|(column, value)| (column.to_string(), Raw::Text(value.to_string())))
        .collect()
}

fn args(pairs: &[(&str, Argument)]) -> Arguments {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

fn setup() -> Engine<SqliteAdapter> {
    let adapter = SqliteAdapter::new(PersistenceMode::InMemory).expect("adapter");
    let engine = Engine::parse(SOURCE, adapter).expect("parse");
    {
        let mut adapter = engine.adapter();
        adapter
            .insert("User", &record(&[("id", "1"), ("name", "Blogger")]))
            .expect("user");
        adapter
            .insert("Post", &record(&[("id", "101"), ("title", "First Post")]))
            .expect("post 101");
        adapter
            .insert("Post", &record(&[("id", "102"), ("title", "Second Post")]))
            .expect("post 102");
        adapter
            .insert("post_user", &record(&[("post_id", "101"), ("user_id", "1")]))
            .expect("link 101");
        adapter
            .insert("post_user", &record(&[("post_id", "102"), ("user_id", "1")]))
            .expect("link 102");
    }
    engine
}

#[test]
fn serialization_omits_unresolved_relations() {
    let engine = setup();
    let user = engine
        .call("GetUser", args(&[("id", Argument::from(1))]))
        .expect("get");
    assert_eq!(user["name"], "Blogger");
    let object = user.as_object().expect("object");
    assert!(
        !object.contains_key("posts"),
        "an unread relation must not appear in the tree"
    );
}

#[test]
fn a_relation_read_traverses_the_junction_table() {
    let engine = setup();
    let posts = engine
        .call("GetUserPosts", args(&[("id", Argument::from(1))]))
        .expect("get posts");
    let mut posts = posts.as_array().expect("list").clone();
    assert_eq!(posts.len(), 2);
    posts.sort_by_key(|post| post["id"].as_str().unwrap().parse::<i64>().unwrap());
    assert_eq!(posts[0]["title"], "First Post");
    assert_eq!(posts[1]["title"], "Second Post");
}

#[test]
fn junction_rows_receive_a_create_time() {
    let engine = setup();
    let links = engine
        .adapter()
        .find("post_user", &vec![("user_id".to_string(), Raw::Text("1".to_string()))])
        .expect("links");
    assert_eq!(links.len(), 2);
    for link in links {
        match link.get("create_time") {
            Some(Raw::Text(stamp)) => assert!(!stamp.is_empty()),
            other => panic!("expected a create_time text, got {other:?}"),
        }
    }
}

#[test]
fn junction_naming_is_independent_of_the_declaring_side() {
    // the same physical schema regardless of which entity declares the list
    let mirrored = "
Post { number:id [primary], str[100]:title, List[User]:authors }
User { number:id [primary], str[50]:name }
";
    let layout_a = JunctionLayout::of("User", "id", "Post", "id");
    let layout_b = JunctionLayout::of("Post", "id", "User", "id");
    assert_eq!(layout_a.table, "post_user");
    assert_eq!(layout_b.table, layout_a.table);
    assert_eq!(layout_a.first_col, "post_id");
    assert_eq!(layout_a.second_col, "user_id");

    let adapter = SqliteAdapter::new(PersistenceMode::InMemory).expect("adapter");
    let engine = Engine::parse(mirrored, adapter).expect("parse");
    // the junction table exists under the lex-ordered name
    engine
        .adapter()
        .find("post_user", &Vec::new())
        .expect("junction table exists");
}

#[test]
fn the_registry_exposes_the_undeclared_direction() {
    // posts declared on User only; traversal from Post still works
    let engine = setup();
    let link = engine
        .registry()
        .get("Post", "User")
        .expect("reverse direction registered")
        .clone();
    assert_eq!(link.table, "post_user");
    assert_eq!(link.source_col, "post_id");
    assert_eq!(link.target_col, "user_id");
}
