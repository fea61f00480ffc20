use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};

/// Where a file monitor last read up to. `offset` is monotonic within an
/// `(path, inode)` pair; a rotation is detected by `inode` changing, which
/// resets `offset` per the source's configured seek strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub path: String,
    pub inode: u64,
    pub offset: u64,
    pub last_read_at: DateTime<Utc>,
}

impl Position {
    pub fn new(path: impl Into<String>, inode: u64) -> Self {
        Self {
            path: path.into(),
            inode,
            offset: 0,
            last_read_at: Utc::now(),
        }
    }

    /// `None` if `new_offset` would move the offset backwards without an
    /// inode change -- that's a monitor bug, not a legitimate rotation.
    pub fn advance(&self, new_offset: u64, observed_at: DateTime<Utc>) -> Option<Self> {
        if new_offset < self.offset {
            return None;
        }
        Some(Self {
            offset: new_offset,
            last_read_at: observed_at,
            ..self.clone()
        })
    }

    pub fn rotated(&self, new_inode: u64, reset_offset: u64, observed_at: DateTime<Utc>) -> Self {
        Self {
            path: self.path.clone(),
            inode: new_inode,
            offset: reset_offset,
            last_read_at: observed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_rejects_non_monotonic_offset() {
        let p = Position {
            offset: 100,
            ..Position::new("/var/log/app.log", 1)
        };
        assert!(p.advance(50, Utc::now()).is_none());
        assert!(p.advance(100, Utc::now()).is_some());
        assert!(p.advance(200, Utc::now()).is_some());
    }

    #[test]
    fn rotation_resets_offset_under_new_inode() {
        let p = Position {
            offset: 500,
            ..Position::new("/var/log/app.log", 1)
        };
        let rotated = p.rotated(2, 0, Utc::now());
        assert_eq!(rotated.inode, 2);
        assert_eq!(rotated.offset, 0);
    }
}
