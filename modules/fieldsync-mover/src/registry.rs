use crate::error::{MoverError, Result};
use crate::mover::Mover;

/// The fixed, ordered set of movers a service runs, built once at startup.
pub struct SourceRegistry {
    movers: Vec<Mover>,
}

impl SourceRegistry {
    pub fn new(movers: Vec<Mover>) -> Result<Self> {
        for (i, mover) in movers.iter().enumerate() {
            if movers[..i].iter().any(|m| m.name() == mover.name()) {
                return Err(MoverError::DuplicateSource(mover.name().to_string()));
            }
        }
        Ok(Self { movers })
    }

    pub fn get(&self, name: &str) -> Result<&Mover> {
        self.movers
            .iter()
            .find(|m| m.name() == name)
            .ok_or_else(|| MoverError::UnknownSource(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mover> {
        self.movers.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.movers.iter().map(|m| m.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.movers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.movers.is_empty()
    }
}
