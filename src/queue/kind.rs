use std::fmt;
use std::hash::Hash;
use std::str::FromStr;

/// Closed set of operation kinds an application can queue.
///
/// The tag is what gets persisted. `from_tag` returns `None` for tags this
/// build does not know (for example written by a newer version sharing the
/// same store); such entries are left pending untouched.
pub trait OperationKind: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    fn tag(&self) -> &'static str;

    fn from_tag(tag: &str) -> Option<Self>;
}

/// Operations the ski-touring client defers while offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TourOperation {
    /// Publish a new conditions report.
    AddReport,
    UpdateReport,
    DeleteReport,
    /// Push the local list of favourite tours.
    SyncFavorites,
}

impl TourOperation {
    pub const ALL: [TourOperation; 4] = [
        TourOperation::AddReport,
        TourOperation::UpdateReport,
        TourOperation::DeleteReport,
        TourOperation::SyncFavorites,
    ];
}

impl OperationKind for TourOperation {
    fn tag(&self) -> &'static str {
        match self {
            TourOperation::AddReport => "add_report",
            TourOperation::UpdateReport => "update_report",
            TourOperation::DeleteReport => "delete_report",
            TourOperation::SyncFavorites => "sync_favorites",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }
}

impl fmt::Display for TourOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for TourOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_tag(s).ok_or_else(|| {
            let known: Vec<&str> = Self::ALL.iter().map(|k| k.tag()).collect();
            format!("unknown operation kind '{s}' (expected one of: {})", known.join(", "))
        })
    }
}
