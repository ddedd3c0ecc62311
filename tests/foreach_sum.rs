use entwine::adapter::{Adapter, Record};
use entwine::datatype::Raw;
use entwine::parley::{Argument, Arguments, Engine};
use entwine::persist::{PersistenceMode, SqliteAdapter};

const SOURCE: &str = "
Cart { number:id [primary], List[Product]:products }
Product { number:id [primary], str[50]:name, number[10.2]:price }

CalculateTotal(number:id):
    Get the Cart by id of {id} as cart
    Set {total} = 0
    For Each product in {cart.products}:
        Set {total} = {product.price} + {total}
    return {total}

CountProducts(number:id):
    Get the Cart by id of {id} as cart
    Set {count} = 0
    For Each product in {cart.products}:
        Set {count} = {count} + 1
    return {count}
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
            .insert("Cart", &record(&[("id", "1")]))
            .expect("cart");
        for (id, name, price) in [
            ("11", "Rope", "10.50"),
            ("12", "Torch", "20.00"),
            ("13", "Chalk", "5.50"),
        ] {
            adapter
                .insert(
                    "Product",
                    &record(&[("id", id), ("name", name), ("price", price)]),
                )
                .expect("product");
            adapter
                .insert(
                    "cart_product",
                    &record(&[("cart_id", "1"), ("product_id", id)]),
                )
                .expect("link");
        }
    }
    engine
}

#[test]
fn summing_relation_prices_is_exact_to_the_declared_scale() {
    let engine = setup();
    let total = engine
        .call("CalculateTotal", args(&[("id", Argument::from(1))]))
        .expect("total");
    // string-equal: the scale-2 canonical form, no float drift
    assert_eq!(total, "36.00");
}

#[test]
fn an_empty_relation_sums_to_the_seed_value() {
    let engine = setup();
    engine
        .adapter()
        .insert("Cart", &record(&[("id", "2")]))
        .expect("empty cart");
    let total = engine
        .call("CalculateTotal", args(&[("id", Argument::from(2))]))
        .expect("total");
    assert_eq!(total, "0");
}

#[test]
fn loops_count_their_iterations() {
    let engine = setup();
    let count = engine
        .call("CountProducts", args(&[("id", Argument::from(1))]))
        .expect("count");
    assert_eq!(count, "3");
}
