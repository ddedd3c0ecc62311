use entwine::datatype::{parse_datetime, BinOp, CmpOp, Number, Text, Value, ValueKind};
use entwine::error::EntwineError;

use proptest::prelude::*;

fn cents_to_text(cents: i64) -> String {
    format!("{}.{:02}", cents / 100, cents % 100)
}

#[test]
fn scale_rejects_excess_fractional_digits() {
    let err = Number::parse("1.234", Some(10), Some(2)).unwrap_err();
    assert!(matches!(err, EntwineError::Validation(_)));
    // trailing zeros are not excess digits
    Number::parse("1.230", Some(10), Some(2)).expect("1.230 normalizes to scale 2");
}

#[test]
fn precision_caps_the_integer_magnitude() {
    // number[5.2] admits values strictly below 10^3
    Number::parse("999.99", Some(5), Some(2)).expect("within precision");
    let err = Number::parse("1000.00", Some(5), Some(2)).unwrap_err();
    assert!(matches!(err, EntwineError::Validation(_)));
    let err = Number::parse("-1000.00", Some(5), Some(2)).unwrap_err();
    assert!(matches!(err, EntwineError::Validation(_)));
}

#[test]
fn canonical_form_pads_to_the_declared_scale() {
    let n = Number::parse("36", Some(10), Some(2)).expect("number");
    assert_eq!(n.canonical(), "36.00");
    let n = Number::parse("0.5", None, None).expect("number");
    assert_eq!(n.canonical(), "0.5");
}

#[test]
fn arithmetic_inherits_the_left_operands_caps() {
    let price = Number::parse("10.50", Some(10), Some(2)).expect("price");
    let plain = Number::parse("0", None, None).expect("zero");
    let sum = price.add(&plain).expect("sum");
    assert_eq!(sum.canonical(), "10.50");
    // the mirrored orientation loses the caps
    let sum = plain.add(&price).expect("sum");
    assert_eq!(sum.canonical(), "10.5");
}

#[test]
fn multiplication_overflowing_the_scale_errors() {
    let a = Number::parse("1.11", Some(10), Some(2)).expect("a");
    let b = Number::parse("1.11", None, None).expect("b");
    // 1.11 * 1.11 = 1.2321 — four fractional digits, no silent rounding
    let err = a.mul(&b).unwrap_err();
    assert!(matches!(err, EntwineError::Validation(_)));
}

#[test]
fn division_is_exact_or_an_error() {
    let a = Number::parse("5.00", Some(10), Some(2)).expect("a");
    let two = Number::parse("2", None, None).expect("two");
    assert_eq!(a.div(&two).expect("exact").canonical(), "2.50");

    let three = Number::parse("3", None, None).expect("three");
    let err = a.div(&three).unwrap_err();
    assert!(matches!(err, EntwineError::Validation(_)));

    let zero = Number::parse("0", None, None).expect("zero");
    let err = a.div(&zero).unwrap_err();
    assert!(matches!(err, EntwineError::Validation(_)));
}

#[test]
fn rounding_is_half_up() {
    let n = Number::parse("2.345", None, None).expect("n");
    assert_eq!(n.round(2).expect("rounded").canonical(), "2.35");
    let n = Number::parse("2.344", None, None).expect("n");
    assert_eq!(n.round(2).expect("rounded").canonical(), "2.34");
}

#[test]
fn string_length_is_validated_on_construction_and_concat() {
    let err = Text::new("abcdef".to_string(), Some(5)).unwrap_err();
    assert!(matches!(err, EntwineError::Validation(_)));
    let t = Text::new("abc".to_string(), Some(5)).expect("fits");
    let err = t.concat("def").unwrap_err();
    assert!(matches!(err, EntwineError::Validation(_)));
}

#[test]
fn left_operand_selects_the_operation() {
    let s = Value::String(Text::new("total: ".to_string(), None).unwrap());
    let n = Value::Number(Number::parse("36.00", Some(10), Some(2)).unwrap());
    let joined = s.apply(BinOp::Add, &n).expect("concat");
    assert_eq!(joined.to_string(), "total: 36.00");
    // number + string is not promoted
    let err = n.apply(BinOp::Add, &s).unwrap_err();
    assert!(matches!(err, EntwineError::Resolution(_)));
}

#[test]
fn booleans_combine_without_ordering() {
    let t = Value::Bool(true);
    let f = Value::Bool(false);
    assert_eq!(t.and(&f).expect("and"), Value::Bool(false));
    assert_eq!(t.or(&f).expect("or"), Value::Bool(true));
    assert_eq!(f.not().expect("not"), Value::Bool(true));
    let err = t.compare(CmpOp::Lt, &f).unwrap_err();
    assert!(matches!(err, EntwineError::Resolution(_)));
}

#[test]
fn datetimes_compare_on_the_instant() {
    let early = Value::DateTime(parse_datetime("2020-01-01").expect("early"));
    let late = Value::DateTime(parse_datetime("2024-06-15 12:30:00").expect("late"));
    assert!(early.compare(CmpOp::Lt, &late).expect("lt"));
    assert!(late.compare(CmpOp::Gt, &early).expect("gt"));
    assert!(!early.compare(CmpOp::Eq, &late).expect("eq"));
}

#[test]
fn typed_versus_raw_comparison_wraps_the_raw_side() {
    let n = Value::Number(Number::parse("100.50", Some(10), Some(2)).unwrap());
    let raw = entwine::datatype::Raw::Text("100.50".to_string());
    assert!(n.compare_raw(CmpOp::Eq, &raw).expect("eq"));
}

#[test]
fn kind_tokens_parse_case_insensitively() {
    assert_eq!(
        ValueKind::parse("NUMBER[10.2]").expect("kind"),
        ValueKind::Number {
            precision: Some(10),
            scale: Some(2)
        }
    );
    assert_eq!(
        ValueKind::parse("Str[50]").expect("kind"),
        ValueKind::String {
            max_length: Some(50)
        }
    );
    assert_eq!(ValueKind::parse("Bool").expect("kind"), ValueKind::Bool);
    assert_eq!(
        ValueKind::parse("DateTime").expect("kind"),
        ValueKind::DateTime
    );
    assert!(matches!(
        ValueKind::parse("blob").unwrap_err(),
        EntwineError::Schema(_)
    ));
}

proptest! {
    // Precision preservation: sums and differences of scale-2 numbers keep
    // exactly two fractional digits in their textual form.
    #[test]
    fn scaled_addition_matches_integer_cents(a in 0i64..10_000_000, b in 0i64..10_000_000) {
        let left = Number::parse(&cents_to_text(a), Some(12), Some(2)).unwrap();
        let right = Number::parse(&cents_to_text(b), Some(12), Some(2)).unwrap();
        let sum = left.add(&right).unwrap();
        prop_assert_eq!(sum.canonical(), cents_to_text(a + b));
    }

    #[test]
    fn scaled_subtraction_matches_integer_cents(a in 0i64..10_000_000, b in 0i64..10_000_000) {
        let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
        let left = Number::parse(&cents_to_text(hi), Some(12), Some(2)).unwrap();
        let right = Number::parse(&cents_to_text(lo), Some(12), Some(2)).unwrap();
        let difference = left.sub(&right).unwrap();
        prop_assert_eq!(difference.canonical(), cents_to_text(hi - lo));
    }

    #[test]
    fn scaled_multiplication_by_an_integer(a in 0i64..100_000, k in 0i64..1_000) {
        let left = Number::parse(&cents_to_text(a), Some(12), Some(2)).unwrap();
        let right = Number::parse(&k.to_string(), None, None).unwrap();
        let product = left.mul(&right).unwrap();
        prop_assert_eq!(product.canonical(), cents_to_text(a * k));
    }
}
