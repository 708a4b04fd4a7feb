/// Describes one table to watch: its primary key, the column whitelist
/// synced to the server (empty means "every column"), and the foreign-key
/// references `store_data` must keep satisfied before writing a row.
#[derive(Debug, Clone)]
pub struct TableConfig {
    pub table: String,
    pub primary_key: Option<String>,
    pub fields: Vec<String>,
    pub references: Vec<TableReference>,
}

#[derive(Debug, Clone)]
pub struct TableReference {
    pub fkey_table: String,
    pub fkey_field: String,
}

impl TableConfig {
    pub fn new(table: impl Into<String>) -> Self {
        Self { table: table.into(), primary_key: None, fields: Vec::new(), references: Vec::new() }
    }

    /// Explicit primary key column. If omitted, `add_table` resolves it from
    /// the table's own schema and rejects composite keys.
    pub fn primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = Some(column.into());
        self
    }

    /// Restrict synced columns to this whitelist. Omitted columns are never
    /// read, uploaded, or overwritten by `store_data`.
    pub fn fields(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn reference(mut self, fkey_table: impl Into<String>, fkey_field: impl Into<String>) -> Self {
        self.references.push(TableReference { fkey_table: fkey_table.into(), fkey_field: fkey_field.into() });
        self
    }
}
