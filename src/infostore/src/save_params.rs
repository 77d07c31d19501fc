use infostore_lib::{
    ContextId, DocumentMetadata, Field, InfostoreError, InfostoreResult, QuotaOwner, Session,
};
use std::collections::BTreeSet;
use std::io::Read;

/// Sequence number that passes every concurrency check.
pub const UNCHECKED_SEQUENCE: i64 = i64::MAX;

/// Knobs of one save call.
#[derive(Clone, Debug)]
pub struct SaveOptions {
    /// Columns the caller wants written; `None` means every writable column.
    pub modified_columns: Option<BTreeSet<Field>>,
    /// Sequence number the caller last saw.
    pub sequence_number: i64,
    /// Replace the content of the current version instead of adding one.
    pub ignore_version: bool,
    /// Append offset; only valid together with `ignore_version` on an existing document.
    pub offset: u64,
    /// Adjust a taken filename instead of failing; `None` uses the configured default.
    pub auto_rename: Option<bool>,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            modified_columns: None,
            sequence_number: UNCHECKED_SEQUENCE,
            ignore_version: false,
            offset: 0,
            auto_rename: None,
        }
    }
}

impl SaveOptions {
    pub fn columns<I: IntoIterator<Item = Field>>(mut self, columns: I) -> Self {
        self.modified_columns = Some(columns.into_iter().collect());
        self
    }

    pub fn sequence(mut self, sequence_number: i64) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    pub fn overwrite(mut self) -> Self {
        self.ignore_version = true;
        self
    }

    pub fn append_at(mut self, offset: u64) -> Self {
        self.ignore_version = true;
        self.offset = offset;
        self
    }

    pub fn auto_rename(mut self, enabled: bool) -> Self {
        self.auto_rename = Some(enabled);
        self
    }
}

/// Everything one save works with, gathered up front.
pub struct SaveParameters<'a> {
    pub context_id: ContextId,
    pub session: &'a Session,
    pub document: DocumentMetadata,
    /// Stored state before the save, `None` for creations.
    pub original: Option<DocumentMetadata>,
    pub columns: BTreeSet<Field>,
    pub data: Option<&'a mut dyn Read>,
    pub offset: u64,
    pub ignore_version: bool,
    pub sequence_number: i64,
    pub auto_rename: bool,
    pub quota_owner: QuotaOwner,
}

impl<'a> SaveParameters<'a> {
    pub fn new(
        session: &'a Session,
        document: DocumentMetadata,
        original: Option<DocumentMetadata>,
        data: Option<&'a mut dyn Read>,
        options: &SaveOptions,
        default_auto_rename: bool,
        quota_owner: QuotaOwner,
    ) -> InfostoreResult<Self> {
        if options.offset > 0 && (original.is_none() || !options.ignore_version) {
            return Err(InfostoreError::InvalidParam(format!(
                "offset {} needs an existing document saved without a new version",
                options.offset
            )));
        }
        let columns = match options.modified_columns.as_ref() {
            Some(columns) => columns
                .iter()
                .copied()
                .filter(|c| Field::writable().contains(c))
                .collect(),
            None => Field::writable().iter().copied().collect(),
        };
        Ok(Self {
            context_id: session.context_id,
            session,
            document,
            original,
            columns,
            data,
            offset: options.offset,
            ignore_version: options.ignore_version,
            sequence_number: options.sequence_number,
            auto_rename: options.auto_rename.unwrap_or(default_auto_rename),
            quota_owner,
        })
    }

    pub fn is_create(&self) -> bool {
        self.original.is_none()
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    pub fn is_append(&self) -> bool {
        self.offset > 0
    }

    pub fn changes(&self, field: Field) -> bool {
        self.columns.contains(&field)
    }

    pub fn drop_column(&mut self, field: Field) {
        self.columns.remove(&field);
    }

    /// Whether title and filename were equal before the save and the caller
    /// leaves the title alone, so the title keeps following the filename.
    pub fn title_mirrors_filename(&self) -> bool {
        match self.original.as_ref() {
            Some(original) => {
                let title_untouched =
                    !self.changes(Field::Title) || self.document.title == original.title;
                title_untouched && original.filename.as_deref().unwrap_or_default() == original.title
            }
            None => {
                self.document.title.is_empty()
                    || Some(self.document.title.as_str()) == self.document.filename.as_deref()
            }
        }
    }
}
