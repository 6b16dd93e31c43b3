//! Super-droplet population stored as a struct of arrays.

use crate::array::{Array, BoundedArray};
use crate::backend::Primitive;
use crate::error::{Error, Result};

/// Struct-of-arrays super-droplet storage.
///
/// All arrays are parallel: population index `i` across every array refers to
/// the same super-droplet. Extensive attributes hold the value of **one** real
/// droplet; the super-droplet total is `multiplicity[i] * attribute[i]`.
///
/// The active index lists the live super-droplets. It only shrinks, at the
/// compaction that follows a step with deaths.
#[derive(Debug, Clone, PartialEq)]
pub struct Population {
    multiplicity: Array,
    names: Vec<String>,
    extensive: Vec<Array>,
    index: BoundedArray,
}

impl Population {
    /// Build a population from per-super-droplet multiplicities and named
    /// per-droplet extensive attributes.
    ///
    /// Every attribute must have one value per super-droplet and names must be
    /// unique. Negative multiplicities are rejected. Super-droplets with zero
    /// multiplicity are accepted; they drop out at the first compaction.
    pub fn new(multiplicity: Vec<i64>, attributes: Vec<(String, Vec<f64>)>) -> Result<Self> {
        let n = multiplicity.len();
        if attributes.is_empty() {
            return Err(Error::shape(
                Primitive::Array,
                "a population needs at least one extensive attribute",
            ));
        }
        if let Some((i, &value)) = multiplicity.iter().enumerate().find(|&(_, &m)| m < 0) {
            return Err(Error::NegativeMultiplicity {
                pair: None,
                index: i,
                value,
            });
        }

        let mut names = Vec::with_capacity(attributes.len());
        let mut extensive = Vec::with_capacity(attributes.len());
        for (name, values) in attributes {
            if values.len() != n {
                return Err(Error::shape(
                    Primitive::Array,
                    format!(
                        "attribute '{name}' has {} values for {n} super-droplets",
                        values.len()
                    ),
                ));
            }
            if names.contains(&name) {
                return Err(Error::shape(
                    Primitive::Array,
                    format!("attribute '{name}' given twice"),
                ));
            }
            names.push(name);
            extensive.push(Array::from_f64(values));
        }

        Ok(Self {
            multiplicity: Array::from_i64(multiplicity),
            names,
            extensive,
            index: BoundedArray::identity(n),
        })
    }

    /// Number of allocated super-droplets, live or dead.
    pub fn len(&self) -> usize {
        self.multiplicity.len()
    }

    /// Whether no super-droplets are allocated.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of super-droplets in the active index.
    pub fn active_len(&self) -> usize {
        self.index.length()
    }

    /// Multiplicity array (`Int`).
    pub fn multiplicity(&self) -> &Array {
        &self.multiplicity
    }

    /// Mutable multiplicity array.
    pub fn multiplicity_mut(&mut self) -> &mut Array {
        &mut self.multiplicity
    }

    /// Per-droplet values of attribute `name`.
    pub fn attribute(&self, name: &str) -> Option<&Array> {
        self.position(name).map(|i| &self.extensive[i])
    }

    /// Mutable per-droplet values of attribute `name`.
    pub fn attribute_mut(&mut self, name: &str) -> Option<&mut Array> {
        self.position(name).map(|i| &mut self.extensive[i])
    }

    /// Attribute names, in storage order.
    pub fn attribute_names(&self) -> &[String] {
        &self.names
    }

    /// Active index.
    pub fn index(&self) -> &BoundedArray {
        &self.index
    }

    /// Mutable active index.
    pub fn index_mut(&mut self) -> &mut BoundedArray {
        &mut self.index
    }

    /// Split borrows for the update: multiplicity, attributes, index.
    pub fn parts_mut(&mut self) -> (&mut Array, &mut [Array], &mut BoundedArray) {
        (&mut self.multiplicity, &mut self.extensive, &mut self.index)
    }

    /// Total number of real droplets represented by the active super-droplets.
    pub fn total_multiplicity(&self) -> Result<i64> {
        let n = self.multiplicity.i64s(Primitive::Array)?;
        Ok(self
            .index
            .active(Primitive::Array)?
            .iter()
            .map(|&i| n[i as usize])
            .sum())
    }

    /// `sum(n * attr)` over the active super-droplets.
    pub fn total_extensive(&self, name: &str) -> Result<f64> {
        let values = self
            .attribute(name)
            .ok_or_else(|| Error::shape(Primitive::Array, format!("no attribute '{name}'")))?
            .f64s(Primitive::Array)?;
        let n = self.multiplicity.i64s(Primitive::Array)?;
        Ok(self
            .index
            .active(Primitive::Array)?
            .iter()
            .map(|&i| n[i as usize] as f64 * values[i as usize])
            .sum())
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }
}
