// src/genome/mod.rs

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A single gene value of a genome.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Allele {
    Flag(bool),
    Integer(i64),
    Continuous(f64),
    Categorical(String),
}

impl PartialEq for Allele {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Allele::Flag(a), Allele::Flag(b)) => a == b,
            (Allele::Integer(a), Allele::Integer(b)) => a == b,
            // Bitwise so that equality agrees with the hash below.
            (Allele::Continuous(a), Allele::Continuous(b)) => a.to_bits() == b.to_bits(),
            (Allele::Categorical(a), Allele::Categorical(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Allele {}

impl Hash for Allele {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Allele::Flag(v) => v.hash(state),
            Allele::Integer(v) => v.hash(state),
            Allele::Continuous(v) => v.to_bits().hash(state),
            Allele::Categorical(v) => v.hash(state),
        }
    }
}

impl fmt::Display for Allele {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Allele::Flag(v) => write!(f, "{v}"),
            Allele::Integer(v) => write!(f, "{v}"),
            Allele::Continuous(v) => write!(f, "{v}"),
            Allele::Categorical(v) => write!(f, "{v}"),
        }
    }
}

/// A candidate configuration of the target algorithm.
///
/// Two genomes are the same genome if their genes are the same. The age is
/// carried along for the population logic that owns it and plays no part in
/// equality or hashing, so a genome keeps its identity across generations.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Genome {
    genes: BTreeMap<String, Allele>,
    #[serde(default)]
    age: u32,
}

impl Genome {
    pub fn new(genes: BTreeMap<String, Allele>) -> Self {
        Self { genes, age: 0 }
    }

    pub fn with_age(mut self, age: u32) -> Self {
        self.age = age;
        self
    }

    pub fn age(&self) -> u32 {
        self.age
    }

    pub fn genes(&self) -> &BTreeMap<String, Allele> {
        &self.genes
    }

    pub fn gene(&self, name: &str) -> Option<&Allele> {
        self.genes.get(name)
    }

    /// Builds a genome with every gene drawn uniformly from `0..=100`.
    ///
    /// Only used to seed demo populations; real populations come from the
    /// genetic operators upstream.
    pub fn random(gene_names: &[&str], rng: &mut impl Rng) -> Self {
        let genes = gene_names
            .iter()
            .map(|name| (name.to_string(), Allele::Integer(rng.gen_range(0..=100))))
            .collect();
        Self::new(genes)
    }
}

impl PartialEq for Genome {
    fn eq(&self, other: &Self) -> bool {
        self.genes == other.genes
    }
}

impl Eq for Genome {}

impl Hash for Genome {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.genes.hash(state);
    }
}

impl fmt::Display for Genome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (name, value)) in self.genes.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}: {value}")?;
        }
        write!(f, "]")
    }
}

/// Identifier of one problem input.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Instance(String);

impl Instance {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TournamentId(pub u32);

impl fmt::Display for TournamentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// The unit of evaluable work.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GenomeInstancePair {
    pub genome: Genome,
    pub instance: Instance,
}

impl GenomeInstancePair {
    pub fn new(genome: Genome, instance: Instance) -> Self {
        Self { genome, instance }
    }
}

/// Identifies a genome's participation in one tournament.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GenomeTournamentKey {
    pub genome: Genome,
    pub tournament_id: TournamentId,
}

impl GenomeTournamentKey {
    pub fn new(genome: Genome, tournament_id: TournamentId) -> Self {
        Self {
            genome,
            tournament_id,
        }
    }
}
