use criterion::{black_box, criterion_group, criterion_main, Criterion};

use entwine::parley::{Argument, Arguments, Engine};
use entwine::persist::{PersistenceMode, SqliteAdapter};

const SOURCE: &str = "
Item { number:id [primary], str[50]:name, number[10.2]:price }

CreateItem(number:id, str[50]:name, number:price):
    Create a Item with id of {id} and name of {name} and price of {price} as item
    return {item}

Classify(number:val):
    If {val} is greater than 10:
        return \"High\"
    If {val} is less than 5:
        return \"Low\"
    return \"Medium\"
";

fn args(pairs: &[(&str, Argument)]) -> Arguments {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

pub fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("parse", |b| {
        b.iter(|| {
            let adapter = SqliteAdapter::new(PersistenceMode::InMemory).unwrap();
            black_box(Engine::parse(SOURCE, adapter).unwrap())
        })
    });

    let adapter = SqliteAdapter::new(PersistenceMode::InMemory).unwrap();
    let engine = Engine::parse(SOURCE, adapter).unwrap();

    c.bench_function("classify", |b| {
        b.iter(|| {
            black_box(
                engine
                    .call("Classify", args(&[("val", Argument::from(7))]))
                    .unwrap(),
            )
        })
    });

    let mut next_id: i64 = 0;
    c.bench_function("create", |b| {
        b.iter(|| {
            next_id += 1;
            black_box(
                engine
                    .call(
                        "CreateItem",
                        args(&[
                            ("id", Argument::from(next_id)),
                            ("name", Argument::from("Sword")),
                            ("price", Argument::from("100.50")),
                        ]),
                    )
                    .unwrap(),
            )
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
