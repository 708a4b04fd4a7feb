/// Mirrors the shadow table's `changed` column exactly: `0`/`1`/`2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeState {
    Unchanged = 0,
    Changed = 1,
    Corrupted = 2,
}

impl ChangeState {
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Unchanged),
            1 => Some(Self::Changed),
            2 => Some(Self::Corrupted),
            _ => None,
        }
    }

    pub fn as_i64(self) -> i64 {
        self as i64
    }
}
