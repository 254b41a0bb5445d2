use std::cmp::Ordering;

use crate::value::{FirestoreValue, ValueKind};

/// Total order over values, mirroring the backend's index order. Values of different
/// types sort by [`FirestoreValue::type_order`]; integers and doubles compare
/// numerically and NaN sorts before every other number.
pub fn compare_values(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let type_ordering = left.type_order().cmp(&right.type_order());
    if type_ordering != Ordering::Equal {
        return type_ordering;
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(a), ValueKind::Boolean(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Integer(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Double(b)) => compare_doubles(*a as f64, *b),
        (ValueKind::Double(a), ValueKind::Integer(b)) => compare_doubles(*a, *b as f64),
        (ValueKind::Double(a), ValueKind::Double(b)) => compare_doubles(*a, *b),
        (ValueKind::Timestamp(a), ValueKind::Timestamp(b)) => a.cmp(b),
        (ValueKind::String(a), ValueKind::String(b)) => a.cmp(b),
        (ValueKind::Bytes(a), ValueKind::Bytes(b)) => a.as_slice().cmp(b.as_slice()),
        (ValueKind::Reference(a), ValueKind::Reference(b)) => compare_references(a, b),
        (ValueKind::GeoPoint(a), ValueKind::GeoPoint(b)) => compare_doubles(a.latitude(), b.latitude())
            .then_with(|| compare_doubles(a.longitude(), b.longitude())),
        (ValueKind::Array(a), ValueKind::Array(b)) => {
            for (l, r) in a.values().iter().zip(b.values().iter()) {
                let ordering = compare_values(l, r);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.values().len().cmp(&b.values().len())
        }
        (ValueKind::Map(a), ValueKind::Map(b)) => {
            let mut left_fields = a.fields().iter();
            let mut right_fields = b.fields().iter();
            loop {
                match (left_fields.next(), right_fields.next()) {
                    (Some((lk, lv)), Some((rk, rv))) => {
                        let ordering = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                        if ordering != Ordering::Equal {
                            return ordering;
                        }
                    }
                    (Some(_), None) => return Ordering::Greater,
                    (None, Some(_)) => return Ordering::Less,
                    (None, None) => return Ordering::Equal,
                }
            }
        }
        _ => Ordering::Equal,
    }
}

/// Equality as used by query filters: numbers compare by value, so `1 == 1.0`,
/// while NaN never equals anything.
pub fn values_equal(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    if left.is_nan() || right.is_nan() {
        return false;
    }
    left.type_order() == right.type_order() && compare_values(left, right) == Ordering::Equal
}

fn compare_doubles(left: f64, right: f64) -> Ordering {
    match left.partial_cmp(&right) {
        Some(ordering) => ordering,
        None => left.is_nan().cmp(&right.is_nan()).reverse(),
    }
}

fn compare_references(left: &str, right: &str) -> Ordering {
    let mut l = left.split('/');
    let mut r = right.split('/');
    loop {
        match (l.next(), r.next()) {
            (Some(a), Some(b)) => match a.cmp(b) {
                Ordering::Equal => continue,
                other => return other,
            },
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (None, None) => return Ordering::Equal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Timestamp;

    #[test]
    fn orders_across_types() {
        let ordered = [
            FirestoreValue::null(),
            FirestoreValue::from_bool(false),
            FirestoreValue::from_bool(true),
            FirestoreValue::from_double(f64::NAN),
            FirestoreValue::from_integer(-5),
            FirestoreValue::from_double(1.5),
            FirestoreValue::from_integer(2),
            FirestoreValue::from_timestamp(Timestamp::new(10, 0)),
            FirestoreValue::from_string("a"),
            FirestoreValue::from_array(vec![]),
        ];
        for pair in ordered.windows(2) {
            assert_eq!(compare_values(&pair[0], &pair[1]), Ordering::Less, "{pair:?}");
        }
    }

    #[test]
    fn numbers_compare_by_value() {
        assert!(values_equal(
            &FirestoreValue::from_integer(1),
            &FirestoreValue::from_double(1.0)
        ));
        assert!(!values_equal(
            &FirestoreValue::from_double(f64::NAN),
            &FirestoreValue::from_double(f64::NAN)
        ));
    }
}
