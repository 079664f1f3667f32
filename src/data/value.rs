//! Path access, equality and ordering over BSON values.
//!
//! These follow MongoDB's query semantics closely enough that the
//! in-process evaluator and a real server agree on the documents the
//! engine produces: dotted paths descend through arrays, equality matches
//! array elements, and numbers compare across int32/int64/double.

use std::cmp::Ordering;

use bson::{Bson, Document};

fn collect_at<'a>(value: &'a Bson, segments: &[&str], out: &mut Vec<&'a Bson>) {
    match segments.split_first() {
        None => out.push(value),
        Some((head, rest)) => match value {
            Bson::Document(doc) => {
                if let Some(v) = doc.get(*head) {
                    collect_at(v, rest, out);
                }
            }
            Bson::Array(items) => {
                for item in items {
                    if let Bson::Document(doc) = item {
                        if let Some(v) = doc.get(*head) {
                            collect_at(v, rest, out);
                        }
                    }
                }
            }
            _ => {}
        },
    }
}

/// Every value reachable at `path`, descending through arrays of
/// sub-documents. Arrays found at the end of the path are returned as is.
pub fn values_at<'a>(doc: &'a Document, path: &str) -> Vec<&'a Bson> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    if let Some((head, rest)) = segments.split_first() {
        if let Some(v) = doc.get(*head) {
            collect_at(v, rest, &mut out);
        }
    }
    out
}

fn resolve_in(value: &Bson, segments: &[&str]) -> Option<Bson> {
    match segments.split_first() {
        None => Some(value.clone()),
        Some((head, rest)) => match value {
            Bson::Document(doc) => doc.get(*head).and_then(|v| resolve_in(v, rest)),
            Bson::Array(items) => Some(Bson::Array(
                items
                    .iter()
                    .filter(|item| matches!(item, Bson::Document(_)))
                    .filter_map(|item| resolve_in(item, segments))
                    .collect(),
            )),
            _ => None,
        },
    }
}

/// Value of a `$path` expression: traversing an array yields the array of
/// the values found in its elements.
pub fn resolve(doc: &Document, path: &str) -> Option<Bson> {
    let segments: Vec<&str> = path.split('.').collect();
    let (head, rest) = segments.split_first()?;
    doc.get(*head).and_then(|v| resolve_in(v, rest))
}

fn collect_documents<'a>(value: &'a Bson, segments: &[&str], out: &mut Vec<&'a Document>) {
    match value {
        Bson::Array(items) => {
            for item in items {
                collect_documents(item, segments, out);
            }
        }
        Bson::Document(doc) => match segments.split_first() {
            None => out.push(doc),
            Some((head, rest)) => {
                if let Some(v) = doc.get(*head) {
                    collect_documents(v, rest, out);
                }
            }
        },
        _ => {}
    }
}

fn collect_documents_mut<'a>(
    value: &'a mut Bson,
    segments: &[&str],
    out: &mut Vec<&'a mut Document>,
) {
    match value {
        Bson::Array(items) => {
            for item in items {
                collect_documents_mut(item, segments, out);
            }
        }
        Bson::Document(doc) => match segments.split_first() {
            None => out.push(doc),
            Some((head, rest)) => {
                if let Some(v) = doc.get_mut(*head) {
                    collect_documents_mut(v, rest, out);
                }
            }
        },
        _ => {}
    }
}

/// Sub-documents stored at `path`, flattening arrays on the way and at
/// the end. An empty path yields `doc` itself.
pub fn subdocuments<'a>(doc: &'a Document, path: &str) -> Vec<&'a Document> {
    if path.is_empty() {
        return vec![doc];
    }
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    if let Some(v) = doc.get(segments[0]) {
        collect_documents(v, &segments[1..], &mut out);
    }
    out
}

pub fn subdocuments_mut<'a>(doc: &'a mut Document, path: &str) -> Vec<&'a mut Document> {
    if path.is_empty() {
        return vec![doc];
    }
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    if let Some(v) = doc.get_mut(segments[0]) {
        collect_documents_mut(v, &segments[1..], &mut out);
    }
    out
}

/// Sets `path`, creating intermediate sub-documents as needed.
pub fn set_path(doc: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
        }
        Some((head, rest)) => {
            if !matches!(doc.get(head), Some(Bson::Document(_))) {
                doc.insert(head, Document::new());
            }
            if let Some(Bson::Document(child)) = doc.get_mut(head) {
                set_path(child, rest, value);
            }
        }
    }
}

/// Numeric view of a BSON value used by arithmetic and accumulators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(i64),
    Double(f64),
}

impl Number {
    pub fn from_bson(value: &Bson) -> Option<Number> {
        match value {
            Bson::Int32(i) => Some(Number::Int(*i as i64)),
            Bson::Int64(i) => Some(Number::Int(*i)),
            Bson::Double(d) => Some(Number::Double(*d)),
            _ => None,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Double(d) => d,
        }
    }

    pub fn add(self, other: Number) -> Number {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a
                .checked_add(b)
                .map(Number::Int)
                .unwrap_or(Number::Double(a as f64 + b as f64)),
            (a, b) => Number::Double(a.as_f64() + b.as_f64()),
        }
    }

    pub fn sub(self, other: Number) -> Number {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a
                .checked_sub(b)
                .map(Number::Int)
                .unwrap_or(Number::Double(a as f64 - b as f64)),
            (a, b) => Number::Double(a.as_f64() - b.as_f64()),
        }
    }

    pub fn mul(self, other: Number) -> Number {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a
                .checked_mul(b)
                .map(Number::Int)
                .unwrap_or(Number::Double(a as f64 * b as f64)),
            (a, b) => Number::Double(a.as_f64() * b.as_f64()),
        }
    }

    /// Integers that fit stay int32, like the server's `$sum` and `$size`.
    pub fn into_bson(self) -> Bson {
        match self {
            Number::Int(i) => match i32::try_from(i) {
                Ok(small) => Bson::Int32(small),
                Err(_) => Bson::Int64(i),
            },
            Number::Double(d) => Bson::Double(d),
        }
    }
}

pub fn values_equal(a: &Bson, b: &Bson) -> bool {
    match (Number::from_bson(a), Number::from_bson(b)) {
        (Some(Number::Int(x)), Some(Number::Int(y))) => x == y,
        (Some(x), Some(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Query equality: a stored array matches when any element equals the
/// expected value, or when the whole array does.
pub fn matches_value(stored: &Bson, expected: &Bson) -> bool {
    if values_equal(stored, expected) {
        return true;
    }
    match stored {
        Bson::Array(items) => items.iter().any(|item| values_equal(item, expected)),
        _ => false,
    }
}

fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::MinKey => 0,
        Bson::Null | Bson::Undefined => 1,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 2,
        Bson::String(_) | Bson::Symbol(_) => 3,
        Bson::Document(_) => 4,
        Bson::Array(_) => 5,
        Bson::Binary(_) => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Timestamp(_) => 10,
        Bson::RegularExpression(_) => 11,
        Bson::MaxKey => 13,
        _ => 12,
    }
}

/// Total order over BSON values, ranking types the way the server does.
pub fn compare(a: &Bson, b: &Bson) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }

    match (a, b) {
        (Bson::String(x), Bson::String(y)) => x.cmp(y),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::DateTime(x), Bson::DateTime(y)) => x.cmp(y),
        (Bson::Timestamp(x), Bson::Timestamp(y)) => {
            (x.time, x.increment).cmp(&(y.time, y.increment))
        }
        (Bson::Array(x), Bson::Array(y)) => compare_sequences(x.iter(), y.iter()),
        (Bson::Document(x), Bson::Document(y)) => {
            for ((xk, xv), (yk, yv)) in x.iter().zip(y.iter()) {
                let ord = xk.cmp(yk).then_with(|| compare(xv, yv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => match (Number::from_bson(a), Number::from_bson(b)) {
            (Some(Number::Int(x)), Some(Number::Int(y))) => x.cmp(&y),
            (Some(x), Some(y)) => x.as_f64().total_cmp(&y.as_f64()),
            _ => Ordering::Equal,
        },
    }
}

fn compare_sequences<'a>(
    mut x: impl Iterator<Item = &'a Bson>,
    mut y: impl Iterator<Item = &'a Bson>,
) -> Ordering {
    loop {
        match (x.next(), y.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(a), Some(b)) => {
                let ord = compare(a, b);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}
