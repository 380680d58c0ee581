//! Dotted RCS revision numbers and their structural relations.

use std::fmt::Display;
use std::str::FromStr;

use anyhow::bail;
use anyhow::Result;

/// An RCS revision or branch number, e.g. `1.2`, `1.2.4`, or `1.2.4.1`.
///
/// An even number of components names a revision; an odd number names a
/// branch. Symbolic names may also carry "magic" branch numbers of the form
/// `1.2.0.4`, which stand for the branch `1.2.4`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(bincode::Encode, bincode::Decode)]
pub struct RevNum(Vec<u32>);

impl RevNum {
    pub fn new(components: Vec<u32>) -> Result<Self> {
        if components.is_empty() {
            bail!("empty revision number");
        }
        Ok(Self(components))
    }

    pub fn components(&self) -> &[u32] {
        &self.0
    }

    pub fn is_revision(&self) -> bool {
        self.0.len() % 2 == 0 && !self.is_magic_branch()
    }

    pub fn is_branch(&self) -> bool {
        self.0.len() % 2 == 1 || self.is_magic_branch()
    }

    /// A branch number as it appears under `symbolic names`, e.g. `1.2.0.4`.
    pub fn is_magic_branch(&self) -> bool {
        let n = self.0.len();
        n >= 4 && n % 2 == 0 && self.0[n - 2] == 0
    }

    pub fn is_trunk_revision(&self) -> bool {
        self.0.len() == 2
    }

    /// The first revision on a branch, e.g. `1.2.4.1`.
    pub fn is_first_on_branch(&self) -> bool {
        self.0.len() > 2 && self.0.len() % 2 == 0 && *self.0.last().unwrap() == 1
    }

    /// Convert `1.2.0.4` into the plain branch number `1.2.4`.
    ///
    /// Plain branch numbers pass through unchanged.
    pub fn to_branch(&self) -> Result<RevNum> {
        if self.is_magic_branch() {
            let mut c = self.0.clone();
            let last = c.pop().unwrap();
            *c.last_mut().unwrap() = last;
            return RevNum::new(c);
        }
        if self.0.len() % 2 == 1 {
            return Ok(self.clone());
        }
        bail!("{} is not a branch number", self)
    }

    /// The branch a revision lives on: `1.2.4.1` -> `1.2.4`. Trunk revisions
    /// have no containing branch number.
    pub fn branch(&self) -> Option<RevNum> {
        if self.0.len() > 2 && self.0.len() % 2 == 0 {
            return Some(RevNum(self.0[..self.0.len() - 1].to_vec()));
        }
        None
    }

    /// The revision a branch sprouts from: `1.2.4` (or `1.2.0.4`) -> `1.2`.
    pub fn sprouts_from(&self) -> Result<RevNum> {
        let branch = self.to_branch()?;
        RevNum::new(branch.0[..branch.0.len() - 1].to_vec())
    }

    /// The previous revision on the same line of development, if the number
    /// alone determines it. `1.1` and first-on-branch revisions have none.
    pub fn prev_on_lod(&self) -> Option<RevNum> {
        if !self.is_revision() {
            return None;
        }
        let last = *self.0.last().unwrap();
        if last > 1 {
            let mut c = self.0.clone();
            *c.last_mut().unwrap() = last - 1;
            return Some(RevNum(c));
        }
        None
    }
}

impl FromStr for RevNum {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut components = Vec::new();
        for part in s.split('.') {
            match part.parse::<u32>() {
                Ok(n) => components.push(n),
                Err(_) => bail!("malformed revision number: {:?}", s),
            }
        }
        RevNum::new(components)
    }
}

impl Display for RevNum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for c in &self.0 {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{}", c)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rev(s: &str) -> RevNum {
        s.parse().unwrap()
    }

    #[test]
    fn parses_and_displays() {
        assert_eq!(rev("1.2.3.1").to_string(), "1.2.3.1");
        assert!("1..2".parse::<RevNum>().is_err());
        assert!("".parse::<RevNum>().is_err());
        assert!("1.x".parse::<RevNum>().is_err());
    }

    #[test]
    fn classifies_numbers() {
        assert!(rev("1.2").is_revision());
        assert!(rev("1.2").is_trunk_revision());
        assert!(rev("1.2.4").is_branch());
        assert!(rev("1.2.0.4").is_magic_branch());
        assert!(rev("1.2.0.4").is_branch());
        assert!(!rev("1.2.0.4").is_revision());
        assert!(rev("1.2.4.1").is_first_on_branch());
        assert!(!rev("1.2.4.2").is_first_on_branch());
        assert!(!rev("1.1").is_first_on_branch());
    }

    #[test]
    fn magic_branch_conversion() {
        assert_eq!(rev("1.2.0.4").to_branch().unwrap(), rev("1.2.4"));
        assert_eq!(rev("1.2.4").to_branch().unwrap(), rev("1.2.4"));
        assert!(rev("1.2").to_branch().is_err());
    }

    #[test]
    fn structural_relations() {
        assert_eq!(rev("1.2.4.1").branch(), Some(rev("1.2.4")));
        assert_eq!(rev("1.2").branch(), None);
        assert_eq!(rev("1.2.0.4").sprouts_from().unwrap(), rev("1.2"));
        assert_eq!(rev("1.2.4").sprouts_from().unwrap(), rev("1.2"));
        assert_eq!(rev("1.3").prev_on_lod(), Some(rev("1.2")));
        assert_eq!(rev("1.1").prev_on_lod(), None);
        assert_eq!(rev("1.2.4.1").prev_on_lod(), None);
        assert_eq!(rev("1.2.4.3").prev_on_lod(), Some(rev("1.2.4.2")));
    }

    #[test]
    fn orders_numerically() {
        assert!(rev("1.9") < rev("1.10"));
        assert!(rev("1.2") < rev("1.2.4.1"));
    }
}
