//! Text operations over Unicode scalar values and their transformations.
//!
//! An [`OperationSeq`] describes an edit as a run of components that consume
//! the old document from start to end while producing the new one. Sequences
//! compose, invert, and transform against concurrent sequences, which is the
//! machinery that keeps every client's document convergent.
//!
//! All counts are Unicode scalar values, never bytes or UTF-16 code units.

use std::cmp::Ordering;

use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Error returned when operations cannot be combined or applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum OtError {
    /// The operation does not span the length of the text it is used with.
    #[error("operation length does not match text length")]
    LengthMismatch,
    /// Two supposedly concurrent operations have different base lengths.
    #[error("concurrent operations have different base lengths")]
    BaseLengthMismatch,
}

/// A single component of an [`OperationSeq`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Skip over the next `n` scalar values.
    Retain(u64),
    /// Remove the next `n` scalar values.
    Delete(u64),
    /// Insert the given text at the current position.
    Insert(String),
}

/// An edit to a text document.
///
/// The wire form is a flat JSON array where a positive integer is a retain, a
/// negative integer is a delete of its absolute value, and a string is an
/// insert: `[1, "X", -2, 3]` keeps one scalar, inserts `X`, deletes two, and
/// keeps the final three.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OperationSeq {
    ops: Vec<Operation>,
    base_len: usize,
    target_len: usize,
}

impl OperationSeq {
    /// Creates an empty operation with space reserved for `capacity`
    /// components.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ops: Vec::with_capacity(capacity),
            base_len: 0,
            target_len: 0,
        }
    }

    /// Length of the document this operation applies to, in scalar values.
    pub fn base_len(&self) -> usize {
        self.base_len
    }

    /// Length of the document after this operation is applied.
    pub fn target_len(&self) -> usize {
        self.target_len
    }

    /// The components of this operation, in order.
    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    /// Returns true if this operation changes nothing when applied.
    pub fn is_noop(&self) -> bool {
        matches!(self.ops.as_slice(), [] | [Operation::Retain(_)])
    }

    /// Appends a retain, merging with a trailing retain.
    pub fn retain(&mut self, n: u64) {
        if n == 0 {
            return;
        }
        self.base_len += n as usize;
        self.target_len += n as usize;
        if let Some(Operation::Retain(last)) = self.ops.last_mut() {
            *last += n;
        } else {
            self.ops.push(Operation::Retain(n));
        }
    }

    /// Appends a delete, merging with a trailing delete.
    pub fn delete(&mut self, n: u64) {
        if n == 0 {
            return;
        }
        self.base_len += n as usize;
        if let Some(Operation::Delete(last)) = self.ops.last_mut() {
            *last += n;
        } else {
            self.ops.push(Operation::Delete(n));
        }
    }

    /// Appends an insert, merging with an adjacent insert.
    ///
    /// An insert next to a delete is placed in front of it, so that any two
    /// sequences describing the same edit have the same canonical form.
    pub fn insert(&mut self, s: &str) {
        if s.is_empty() {
            return;
        }
        self.target_len += chars(s);
        match self.ops.as_mut_slice() {
            [.., Operation::Insert(last)] => {
                last.push_str(s);
                return;
            }
            [.., Operation::Insert(prev), Operation::Delete(_)] => {
                prev.push_str(s);
                return;
            }
            _ => {}
        }
        if matches!(self.ops.last(), Some(Operation::Delete(_))) {
            let idx = self.ops.len() - 1;
            self.ops.insert(idx, Operation::Insert(s.to_owned()));
        } else {
            self.ops.push(Operation::Insert(s.to_owned()));
        }
    }

    /// Applies this operation to `text`, producing the edited text.
    ///
    /// Fails with [`OtError::LengthMismatch`] unless the text is exactly
    /// [`base_len`](Self::base_len) scalar values long.
    pub fn apply(&self, text: &str) -> Result<String, OtError> {
        if chars(text) != self.base_len {
            return Err(OtError::LengthMismatch);
        }
        let mut input = text.chars();
        let mut output = String::with_capacity(text.len());
        for op in &self.ops {
            match op {
                Operation::Retain(n) => output.extend(input.by_ref().take(*n as usize)),
                Operation::Delete(n) => {
                    input.by_ref().nth(*n as usize - 1);
                }
                Operation::Insert(s) => output.push_str(s),
            }
        }
        Ok(output)
    }

    /// Computes the operation that undoes this one when applied to its
    /// output, given the text it was applied to.
    pub fn invert(&self, text: &str) -> Self {
        let mut inverse = Self::with_capacity(self.ops.len());
        let mut input = text.chars();
        for op in &self.ops {
            match op {
                Operation::Retain(n) => {
                    inverse.retain(*n);
                    input.by_ref().nth(*n as usize - 1);
                }
                Operation::Delete(n) => {
                    let deleted: String = input.by_ref().take(*n as usize).collect();
                    inverse.insert(&deleted);
                }
                Operation::Insert(s) => inverse.delete(chars(s) as u64),
            }
        }
        inverse
    }

    /// Merges this operation with one that applies to its output, producing
    /// a single operation with the combined effect: for any valid text,
    /// `text.apply(a.compose(b)?) == text.apply(a)?.apply(b)`.
    ///
    /// Fails with [`OtError::LengthMismatch`] unless `self.target_len() ==
    /// other.base_len()`.
    pub fn compose(&self, other: &Self) -> Result<Self, OtError> {
        if self.target_len != other.base_len {
            return Err(OtError::LengthMismatch);
        }
        let mut composed = Self::default();
        let mut iter1 = self.ops.iter().cloned();
        let mut iter2 = other.ops.iter().cloned();
        let mut op1 = iter1.next();
        let mut op2 = iter2.next();
        loop {
            match (&op1, &op2) {
                (None, None) => break,
                // Deletes from the first operation act on text the second
                // one never sees, and inserts from the second act on text
                // the first never saw; both pass through unchanged.
                (Some(Operation::Delete(n)), _) => {
                    composed.delete(*n);
                    op1 = iter1.next();
                }
                (_, Some(Operation::Insert(s))) => {
                    composed.insert(s);
                    op2 = iter2.next();
                }
                (None, _) | (_, None) => return Err(OtError::LengthMismatch),
                (Some(Operation::Retain(a)), Some(Operation::Retain(b))) => match a.cmp(b) {
                    Ordering::Less => {
                        composed.retain(*a);
                        op2 = Some(Operation::Retain(b - a));
                        op1 = iter1.next();
                    }
                    Ordering::Equal => {
                        composed.retain(*a);
                        op1 = iter1.next();
                        op2 = iter2.next();
                    }
                    Ordering::Greater => {
                        composed.retain(*b);
                        op1 = Some(Operation::Retain(a - b));
                        op2 = iter2.next();
                    }
                },
                (Some(Operation::Retain(a)), Some(Operation::Delete(b))) => match a.cmp(b) {
                    Ordering::Less => {
                        composed.delete(*a);
                        op2 = Some(Operation::Delete(b - a));
                        op1 = iter1.next();
                    }
                    Ordering::Equal => {
                        composed.delete(*b);
                        op1 = iter1.next();
                        op2 = iter2.next();
                    }
                    Ordering::Greater => {
                        composed.delete(*b);
                        op1 = Some(Operation::Retain(a - b));
                        op2 = iter2.next();
                    }
                },
                (Some(Operation::Insert(s)), Some(Operation::Delete(b))) => {
                    let len = chars(s) as u64;
                    match len.cmp(b) {
                        Ordering::Less => {
                            op2 = Some(Operation::Delete(b - len));
                            op1 = iter1.next();
                        }
                        Ordering::Equal => {
                            op1 = iter1.next();
                            op2 = iter2.next();
                        }
                        Ordering::Greater => {
                            let rest = split_scalars(s, *b).1.to_owned();
                            op1 = Some(Operation::Insert(rest));
                            op2 = iter2.next();
                        }
                    }
                }
                (Some(Operation::Insert(s)), Some(Operation::Retain(b))) => {
                    let len = chars(s) as u64;
                    match len.cmp(b) {
                        Ordering::Less => {
                            composed.insert(s);
                            op2 = Some(Operation::Retain(b - len));
                            op1 = iter1.next();
                        }
                        Ordering::Equal => {
                            composed.insert(s);
                            op1 = iter1.next();
                            op2 = iter2.next();
                        }
                        Ordering::Greater => {
                            let (head, rest) = split_scalars(s, *b);
                            composed.insert(head);
                            let rest = rest.to_owned();
                            op1 = Some(Operation::Insert(rest));
                            op2 = iter2.next();
                        }
                    }
                }
            }
        }
        Ok(composed)
    }

    /// Transforms this operation against a concurrent one with the same base
    /// document, producing `(a', b')` such that `self.compose(b')? ==
    /// other.compose(a')?`: applying `self` then `b'` reaches the same text
    /// as applying `other` then `a'`.
    ///
    /// When both sequences insert at the same position, self's insert is
    /// placed first. The rule is arbitrary but must be shared by every peer
    /// that transforms operations, or their documents diverge.
    ///
    /// Fails with [`OtError::BaseLengthMismatch`] unless both operations
    /// have the same base length.
    pub fn transform(&self, other: &Self) -> Result<(Self, Self), OtError> {
        if self.base_len != other.base_len {
            return Err(OtError::BaseLengthMismatch);
        }
        let mut a_prime = Self::default();
        let mut b_prime = Self::default();
        let mut iter1 = self.ops.iter().cloned();
        let mut iter2 = other.ops.iter().cloned();
        let mut op1 = iter1.next();
        let mut op2 = iter2.next();
        loop {
            match (&op1, &op2) {
                (None, None) => break,
                (Some(Operation::Insert(s)), _) => {
                    b_prime.retain(chars(s) as u64);
                    a_prime.insert(s);
                    op1 = iter1.next();
                }
                (_, Some(Operation::Insert(s))) => {
                    a_prime.retain(chars(s) as u64);
                    b_prime.insert(s);
                    op2 = iter2.next();
                }
                (None, _) | (_, None) => return Err(OtError::BaseLengthMismatch),
                (Some(Operation::Retain(a)), Some(Operation::Retain(b))) => {
                    let n = *a.min(b);
                    a_prime.retain(n);
                    b_prime.retain(n);
                    match a.cmp(b) {
                        Ordering::Less => {
                            op2 = Some(Operation::Retain(b - a));
                            op1 = iter1.next();
                        }
                        Ordering::Equal => {
                            op1 = iter1.next();
                            op2 = iter2.next();
                        }
                        Ordering::Greater => {
                            op1 = Some(Operation::Retain(a - b));
                            op2 = iter2.next();
                        }
                    }
                }
                // Both sides already deleted the overlapping range; neither
                // transformed operation has anything left to do there.
                (Some(Operation::Delete(a)), Some(Operation::Delete(b))) => match a.cmp(b) {
                    Ordering::Less => {
                        op2 = Some(Operation::Delete(b - a));
                        op1 = iter1.next();
                    }
                    Ordering::Equal => {
                        op1 = iter1.next();
                        op2 = iter2.next();
                    }
                    Ordering::Greater => {
                        op1 = Some(Operation::Delete(a - b));
                        op2 = iter2.next();
                    }
                },
                (Some(Operation::Delete(a)), Some(Operation::Retain(b))) => {
                    a_prime.delete(*a.min(b));
                    match a.cmp(b) {
                        Ordering::Less => {
                            op2 = Some(Operation::Retain(b - a));
                            op1 = iter1.next();
                        }
                        Ordering::Equal => {
                            op1 = iter1.next();
                            op2 = iter2.next();
                        }
                        Ordering::Greater => {
                            op1 = Some(Operation::Delete(a - b));
                            op2 = iter2.next();
                        }
                    }
                }
                (Some(Operation::Retain(a)), Some(Operation::Delete(b))) => {
                    b_prime.delete(*a.min(b));
                    match a.cmp(b) {
                        Ordering::Less => {
                            op2 = Some(Operation::Delete(b - a));
                            op1 = iter1.next();
                        }
                        Ordering::Equal => {
                            op1 = iter1.next();
                            op2 = iter2.next();
                        }
                        Ordering::Greater => {
                            op1 = Some(Operation::Retain(a - b));
                            op2 = iter2.next();
                        }
                    }
                }
            }
        }
        Ok((a_prime, b_prime))
    }
}

impl FromIterator<Operation> for OperationSeq {
    fn from_iter<T: IntoIterator<Item = Operation>>(iter: T) -> Self {
        let mut seq = Self::default();
        for op in iter {
            match op {
                Operation::Retain(n) => seq.retain(n),
                Operation::Delete(n) => seq.delete(n),
                Operation::Insert(s) => seq.insert(&s),
            }
        }
        seq
    }
}

/// Maps a cursor position through an operation.
///
/// Retained text moves the cursor by whatever precedes it, inserted text
/// pushes it right, and a cursor inside a deleted range collapses to the
/// start of that range.
pub fn transform_index(operation: &OperationSeq, position: u32) -> u32 {
    let mut index = position as i64;
    let mut new_index = index;
    for op in operation.ops() {
        match op {
            Operation::Retain(n) => index -= *n as i64,
            Operation::Insert(s) => new_index += chars(s) as i64,
            Operation::Delete(n) => {
                new_index -= index.min(*n as i64);
                index -= *n as i64;
            }
        }
        if index < 0 {
            break;
        }
    }
    new_index as u32
}

/// Number of Unicode scalar values in `s`.
fn chars(s: &str) -> usize {
    s.chars().count()
}

/// Splits `s` at a scalar-value offset, which must not exceed its length.
fn split_scalars(s: &str, n: u64) -> (&str, &str) {
    let boundary = s
        .char_indices()
        .nth(n as usize)
        .map_or(s.len(), |(idx, _)| idx);
    s.split_at(boundary)
}

impl Serialize for OperationSeq {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(self.ops.len()))?;
        for op in &self.ops {
            match op {
                Operation::Retain(n) => seq.serialize_element(&(*n as i64))?,
                Operation::Delete(n) => seq.serialize_element(&-(*n as i64))?,
                Operation::Insert(s) => seq.serialize_element(s)?,
            }
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for OperationSeq {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum WireOp {
            Number(i64),
            Text(String),
        }

        struct SeqVisitor;

        impl<'de> Visitor<'de> for SeqVisitor {
            type Value = OperationSeq;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("an array of integers and strings")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                // Feeding the builders keeps deserialized sequences in the
                // same canonical form as locally constructed ones.
                let mut operation = OperationSeq::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(op) = seq.next_element::<WireOp>()? {
                    match op {
                        WireOp::Number(n) if n > 0 => operation.retain(n as u64),
                        WireOp::Number(n) => operation.delete(n.unsigned_abs()),
                        WireOp::Text(s) => operation.insert(&s),
                    }
                }
                Ok(operation)
            }
        }

        deserializer.deserialize_seq(SeqVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{RngExt, SeedableRng};

    fn random_text(rng: &mut StdRng, len: usize) -> String {
        (0..len)
            .map(|_| {
                if rng.random_bool(0.15) {
                    rng.random_range('\u{1F600}'..='\u{1F64F}')
                } else {
                    rng.random_range('a'..='z')
                }
            })
            .collect()
    }

    fn random_operation(rng: &mut StdRng, text: &str) -> OperationSeq {
        let mut operation = OperationSeq::default();
        let mut remaining = text.chars().count();
        while remaining > 0 {
            let n = rng.random_range(1..=remaining.min(5));
            match rng.random_range(0..4) {
                0 => operation.retain(n as u64),
                1 => operation.delete(n as u64),
                _ => {
                    let len = rng.random_range(1..=4);
                    operation.insert(&random_text(rng, len));
                    operation.retain(n as u64);
                }
            }
            remaining -= n;
        }
        if rng.random_bool(0.3) {
            operation.insert(&random_text(rng, 3));
        }
        operation
    }

    fn seq(json: &str) -> OperationSeq {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn lengths_and_merging() {
        let mut op = OperationSeq::default();
        op.retain(2);
        op.retain(3);
        op.insert("ab");
        op.insert("cd");
        op.delete(1);
        op.delete(1);
        assert_eq!(op.ops().len(), 3);
        assert_eq!(op.base_len(), 7);
        assert_eq!(op.target_len(), 9);

        op.retain(0);
        op.insert("");
        op.delete(0);
        assert_eq!(op.ops().len(), 3);
    }

    #[test]
    fn insert_stays_in_front_of_delete() {
        let mut a = OperationSeq::default();
        a.retain(1);
        a.delete(2);
        a.insert("x");

        let mut b = OperationSeq::default();
        b.retain(1);
        b.insert("x");
        b.delete(2);

        assert_eq!(a, b);
        assert_eq!(a.apply("abc").unwrap(), "axc");
    }

    #[test]
    fn is_noop() {
        let mut op = OperationSeq::default();
        assert!(op.is_noop());
        op.retain(5);
        assert!(op.is_noop());
        op.insert("x");
        assert!(!op.is_noop());
    }

    #[test]
    fn apply_rejects_wrong_length() {
        let mut op = OperationSeq::default();
        op.retain(3);
        assert_eq!(op.apply("ab"), Err(OtError::LengthMismatch));
        assert_eq!(op.apply("abc").unwrap(), "abc");
    }

    #[test]
    fn apply_counts_scalar_values() {
        // "😀" is a single scalar value but four bytes.
        let mut op = OperationSeq::default();
        op.retain(2);
        op.insert("!");
        op.retain(1);
        assert_eq!(op.apply("a😀b").unwrap(), "a😀!b");

        let mut op = OperationSeq::default();
        op.retain(3);
        op.insert("!");
        assert_eq!(op.apply("a😀b").unwrap(), "a😀b!");
    }

    #[test]
    fn invert_restores_text() {
        let text = "hello world";
        let op = seq(r#"[2, "HE", -3, 6, "!"]"#);
        let applied = op.apply(text).unwrap();
        assert_eq!(op.invert(text).apply(&applied).unwrap(), text);
    }

    #[test]
    fn compose_sequential_edits() {
        let first = seq(r#"["hello"]"#);
        let second = seq(r#"[5, " world"]"#);
        let both = first.compose(&second).unwrap();
        assert_eq!(both.apply("").unwrap(), "hello world");

        assert_eq!(
            first.compose(&seq(r#"[1]"#)),
            Err(OtError::LengthMismatch)
        );
    }

    #[test]
    fn transform_rejects_different_bases() {
        let a = seq(r#"[1, "x"]"#);
        let b = seq(r#"[2, "y"]"#);
        assert_eq!(a.transform(&b), Err(OtError::BaseLengthMismatch));
    }

    #[test]
    fn transform_tie_break_prefers_self() {
        // Concurrent inserts at the same position in "abc".
        let alice = seq(r#"[1, "X", 2]"#);
        let bob = seq(r#"[1, "Y", 2]"#);
        let (a_prime, b_prime) = alice.transform(&bob).unwrap();
        let merged = alice.compose(&b_prime).unwrap().apply("abc").unwrap();
        assert_eq!(merged, "aXYbc");
        assert_eq!(bob.compose(&a_prime).unwrap().apply("abc").unwrap(), merged);
    }

    #[test]
    fn transform_insert_against_overlapping_delete() {
        let insert = seq(r#"[5, "!"]"#);
        let delete = seq(r#"[-5]"#);
        let (a_prime, b_prime) = insert.transform(&delete).unwrap();
        assert_eq!(
            insert.compose(&b_prime).unwrap().apply("hello").unwrap(),
            "!"
        );
        assert_eq!(
            delete.compose(&a_prime).unwrap().apply("hello").unwrap(),
            "!"
        );
    }

    #[test]
    fn transform_index_follows_inserts() {
        // A remote insert of three scalars at offset 1 pushes a cursor at
        // offset 2 to offset 5.
        let op = seq(r#"[1, "XYZ", 3]"#);
        assert_eq!(transform_index(&op, 2), 5);
        assert_eq!(transform_index(&op, 0), 0);
        assert_eq!(transform_index(&op, 4), 7);
    }

    #[test]
    fn transform_index_clamps_into_deletions() {
        let op = seq(r#"[1, -3, 2]"#);
        assert_eq!(transform_index(&op, 0), 0);
        assert_eq!(transform_index(&op, 1), 1);
        assert_eq!(transform_index(&op, 2), 1);
        assert_eq!(transform_index(&op, 4), 1);
        assert_eq!(transform_index(&op, 5), 2);
    }

    #[test]
    fn wire_format_round_trip() {
        let wire = r#"[2,"n",-1,2]"#;
        let op = seq(wire);
        assert_eq!(op.base_len(), 5);
        assert_eq!(op.target_len(), 5);
        assert_eq!(serde_json::to_string(&op).unwrap(), wire);

        // Mergeable and empty components collapse while deserializing.
        let op = seq(r#"[1, 1, 0, "ab", "", "cd", -1, -1]"#);
        assert_eq!(serde_json::to_string(&op).unwrap(), r#"[2,"abcd",-2]"#);
    }

    #[test]
    fn random_apply_invert_round_trip() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let len = rng.random_range(0..40);
            let text = random_text(&mut rng, len);
            let op = random_operation(&mut rng, &text);
            let applied = op.apply(&text).unwrap();
            assert_eq!(applied.chars().count(), op.target_len());
            assert_eq!(op.invert(&text).apply(&applied).unwrap(), text);
        }
    }

    #[test]
    fn random_compose_matches_sequential_apply() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..500 {
            let len = rng.random_range(0..40);
            let text = random_text(&mut rng, len);
            let a = random_operation(&mut rng, &text);
            let after_a = a.apply(&text).unwrap();
            let b = random_operation(&mut rng, &after_a);
            let composed = a.compose(&b).unwrap();
            assert_eq!(composed.base_len(), a.base_len());
            assert_eq!(composed.target_len(), b.target_len());
            assert_eq!(
                composed.apply(&text).unwrap(),
                b.apply(&after_a).unwrap()
            );
        }
    }

    #[test]
    fn random_transform_converges() {
        let mut rng = StdRng::seed_from_u64(13);
        for _ in 0..500 {
            let len = rng.random_range(0..40);
            let text = random_text(&mut rng, len);
            let a = random_operation(&mut rng, &text);
            let b = random_operation(&mut rng, &text);
            let (a_prime, b_prime) = a.transform(&b).unwrap();
            assert_eq!(a_prime.base_len(), b.target_len());
            assert_eq!(b_prime.base_len(), a.target_len());

            let via_a = b_prime.apply(&a.apply(&text).unwrap()).unwrap();
            let via_b = a_prime.apply(&b.apply(&text).unwrap()).unwrap();
            assert_eq!(via_a, via_b);

            // The transform is a pure function of its inputs.
            assert_eq!(a.transform(&b).unwrap(), (a_prime, b_prime));
        }
    }

    #[test]
    fn random_wire_round_trip() {
        let mut rng = StdRng::seed_from_u64(17);
        for _ in 0..500 {
            let len = rng.random_range(0..40);
            let text = random_text(&mut rng, len);
            let op = random_operation(&mut rng, &text);
            let encoded = serde_json::to_string(&op).unwrap();
            assert_eq!(serde_json::from_str::<OperationSeq>(&encoded).unwrap(), op);
        }
    }

    #[test]
    fn random_transform_index_lands_in_bounds() {
        let mut rng = StdRng::seed_from_u64(19);
        for _ in 0..500 {
            let len = rng.random_range(1..40);
            let text = random_text(&mut rng, len);
            let op = random_operation(&mut rng, &text);
            let position = rng.random_range(0..=text.chars().count()) as u32;
            let transformed = transform_index(&op, position);
            assert!(transformed as usize <= op.target_len());
        }
    }
}
