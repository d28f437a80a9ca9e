//! QuickCheck integration for equivalence checks
//!
//! Generates attribute values by declared type, so property tests can fill
//! a module's slots with arbitrary data before freezing it.

use modfreeze_core::{AttrType, DictKey, Literal};
use quickcheck::{Arbitrary, Gen};

pub struct TypedLiteral {
    pub ty: AttrType,
    pub literal: Literal,
}

impl TypedLiteral {
    pub fn arbitrary_for_type(ty: &AttrType, g: &mut Gen) -> Self {
        let literal = match ty {
            AttrType::Bool => Literal::Bool(Arbitrary::arbitrary(g)),
            AttrType::Int => Literal::Int(small_int(g)),
            // integral floats keep sums exact
            AttrType::Float => Literal::Float(small_int(g) as f64),
            AttrType::Str => {
                let s: String = Arbitrary::arbitrary(g);
                Literal::Str(s)
            }
            AttrType::List => {
                let len = g.size() % 6;
                Literal::List((0..len).map(|_| Literal::Int(small_int(g))).collect())
            }
            AttrType::Dict => {
                let len = g.size() % 4;
                let entries = (0..len)
                    .map(|i| (DictKey::Str(format!("key_{i}")), Literal::Int(small_int(g))))
                    .collect();
                Literal::Dict(entries)
            }
            AttrType::Tuple => Literal::Tuple(vec![Literal::Int(small_int(g)), Literal::Int(small_int(g))]),
            AttrType::Tensor => {
                let len = (g.size() % 5) + 1;
                Literal::tensor((0..len).map(|_| small_int(g) as f64).collect::<Vec<_>>())
            }
            AttrType::Any | AttrType::Module => Literal::None,
        };

        TypedLiteral { ty: ty.clone(), literal }
    }

    pub fn shrink(&self) -> Vec<TypedLiteral> {
        shrink_literal(&self.literal)
            .into_iter()
            .map(|literal| TypedLiteral {
                ty: self.ty.clone(),
                literal,
            })
            .collect()
    }
}

fn small_int(g: &mut Gen) -> i64 {
    let n: i16 = Arbitrary::arbitrary(g);
    n as i64
}

fn shrink_literal(literal: &Literal) -> Vec<Literal> {
    match literal {
        Literal::Int(i) => shrink_integer(*i),
        Literal::Float(f) if *f != 0.0 => vec![Literal::Float(0.0), Literal::Float((f / 2.0).trunc())],
        Literal::Str(s) if !s.is_empty() => vec![Literal::Str(String::new()), Literal::Str(s.chars().skip(1).collect())],
        Literal::List(items) => shrink_items(items).into_iter().map(Literal::List).collect(),
        Literal::Tensor { data, .. } if data.len() > 1 => {
            let mut shorter = data.clone();
            shorter.pop();
            vec![Literal::tensor(shorter)]
        }
        _ => vec![],
    }
}

fn shrink_integer(i: i64) -> Vec<Literal> {
    if i == 0 {
        return vec![];
    }
    let step = if i > 0 { i - 1 } else { i + 1 };
    vec![Literal::Int(0), Literal::Int(i / 2), Literal::Int(step)]
}

fn shrink_items(items: &[Literal]) -> Vec<Vec<Literal>> {
    if items.is_empty() {
        return vec![];
    }
    let mut shrunk = vec![vec![]];
    for i in 0..items.len() {
        let mut fewer = items.to_vec();
        fewer.remove(i);
        shrunk.push(fewer);
    }
    shrunk
}
