/// Result type alias for project operations.
pub type Result<T> = std::result::Result<T, CrystalError>;

#[derive(Debug, thiserror::Error)]
pub enum CrystalError {
    #[error("URL scheme of {0} is not downloadable")]
    NotADownloadableScheme(String),

    #[error("HTTP request failed: {0}")]
    HttpRequestFailed(String),

    #[error("Project is read-only")]
    ProjectReadOnly,

    #[error("Project is closed")]
    ProjectClosed,

    #[error("Project is locked by another writer")]
    ProjectLocked,

    #[error("Project format version {found} is newer than supported version {supported}")]
    ProjectTooNew { found: u32, supported: u32 },

    #[error("{0} is not a project directory")]
    NotAProject(std::path::PathBuf),

    #[error("Revision id {0} is too high for the on-disk format")]
    ProjectHasTooManyRevisions(i64),

    #[error("Revision {0} is missing its body on disk")]
    RevisionBodyMissing(i64),

    #[error("Revision {0} has no body")]
    NoRevisionBody(i64),

    #[error("Revision was deleted")]
    RevisionDeleted,

    #[error("Not enough free disk space to download more resources")]
    ProjectFreeSpaceTooLow,

    #[error("Resource was already downloaded this session")]
    AlreadyDownloadedThisSession,

    #[error("Cannot reference an entity from another project")]
    CrossProjectReference,

    #[error("A group's source chain must not reach the group itself")]
    GroupSourceCycle,

    #[error("A root resource already exists for this resource")]
    RootResourceAlreadyExists,

    #[error("No such entity in this project")]
    NoSuchEntity,

    #[error(transparent)]
    Pattern(#[from] crystal_common::PatternError),

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CrystalError {
    /// Short class-like name persisted in error revisions.
    pub fn kind_name(&self) -> &'static str {
        match self {
            CrystalError::NotADownloadableScheme(_) => "NotADownloadableScheme",
            CrystalError::HttpRequestFailed(_) => "HttpRequestFailed",
            CrystalError::ProjectReadOnly => "ProjectReadOnly",
            CrystalError::ProjectClosed => "ProjectClosed",
            CrystalError::ProjectLocked => "ProjectLocked",
            CrystalError::ProjectTooNew { .. } => "ProjectTooNew",
            CrystalError::NotAProject(_) => "NotAProject",
            CrystalError::ProjectHasTooManyRevisions(_) => "ProjectHasTooManyRevisions",
            CrystalError::RevisionBodyMissing(_) => "RevisionBodyMissing",
            CrystalError::NoRevisionBody(_) => "NoRevisionBody",
            CrystalError::RevisionDeleted => "RevisionDeleted",
            CrystalError::ProjectFreeSpaceTooLow => "ProjectFreeSpaceTooLow",
            CrystalError::AlreadyDownloadedThisSession => "AlreadyDownloadedThisSession",
            CrystalError::CrossProjectReference => "CrossProjectReference",
            CrystalError::GroupSourceCycle => "GroupSourceCycle",
            CrystalError::RootResourceAlreadyExists => "RootResourceAlreadyExists",
            CrystalError::NoSuchEntity => "NoSuchEntity",
            CrystalError::Pattern(_) => "InvalidUrlPattern",
            CrystalError::Database(_) => "DatabaseError",
            CrystalError::Io(_) => "IoError",
            CrystalError::Other(_) => "Error",
        }
    }

    /// Whether this error means the project went away underneath us,
    /// which the scheduler treats as a quiet stop rather than a crash.
    pub fn is_project_closed(&self) -> bool {
        matches!(self, CrystalError::ProjectClosed)
    }
}

impl From<sqlx::Error> for CrystalError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::PoolClosed => CrystalError::ProjectClosed,
            sqlx::Error::Database(db) if db.message().contains("database is locked") => {
                CrystalError::ProjectLocked
            }
            _ => CrystalError::Database(e),
        }
    }
}
