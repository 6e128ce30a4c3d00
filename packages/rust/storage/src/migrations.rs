//! SQL migration definitions for the oerflow catalog database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as a batch.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: oer_materials, oer_materials_staging, oer_materials_partial",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Production catalog
CREATE TABLE IF NOT EXISTS oer_materials (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    material_url      TEXT NOT NULL UNIQUE,
    provider_uri      TEXT,
    title             TEXT,
    description       TEXT,
    authors           TEXT NOT NULL DEFAULT '[]',
    language          TEXT,
    creation_date     TEXT,
    retrieved_date    TEXT NOT NULL,
    material_type     TEXT,
    mimetype          TEXT,
    license           TEXT,
    material_metadata TEXT NOT NULL DEFAULT '{}',
    validation_status TEXT NOT NULL DEFAULT 'unverified',
    message           TEXT
);

CREATE INDEX IF NOT EXISTS idx_oer_materials_language ON oer_materials(language);
CREATE INDEX IF NOT EXISTS idx_oer_materials_type ON oer_materials(material_type);

-- Staging catalog, same shape as production
CREATE TABLE IF NOT EXISTS oer_materials_staging (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    material_url      TEXT NOT NULL UNIQUE,
    provider_uri      TEXT,
    title             TEXT,
    description       TEXT,
    authors           TEXT NOT NULL DEFAULT '[]',
    language          TEXT,
    creation_date     TEXT,
    retrieved_date    TEXT NOT NULL,
    material_type     TEXT,
    mimetype          TEXT,
    license           TEXT,
    material_metadata TEXT NOT NULL DEFAULT '{}',
    validation_status TEXT NOT NULL DEFAULT 'unverified',
    message           TEXT
);

-- Partial-capture store: one snapshot per (material, stage)
CREATE TABLE IF NOT EXISTS oer_materials_partial (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    material_url  TEXT NOT NULL,
    stage         TEXT NOT NULL,
    captured_at   TEXT NOT NULL,
    message       TEXT,
    material_json TEXT NOT NULL,
    UNIQUE(material_url, stage)
);

CREATE INDEX IF NOT EXISTS idx_oer_materials_partial_url ON oer_materials_partial(material_url);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}

/// `CREATE TABLE` template for a catalog table with a custom name, used when
/// config points a sink at a table the base migration did not create.
pub(crate) fn catalog_table_ddl(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            material_url      TEXT NOT NULL UNIQUE,
            provider_uri      TEXT,
            title             TEXT,
            description       TEXT,
            authors           TEXT NOT NULL DEFAULT '[]',
            language          TEXT,
            creation_date     TEXT,
            retrieved_date    TEXT NOT NULL,
            material_type     TEXT,
            mimetype          TEXT,
            license           TEXT,
            material_metadata TEXT NOT NULL DEFAULT '{{}}',
            validation_status TEXT NOT NULL DEFAULT 'unverified',
            message           TEXT
        )"
    )
}

/// `CREATE TABLE` template for a partial-capture table with a custom name.
pub(crate) fn partial_table_ddl(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            material_url  TEXT NOT NULL,
            stage         TEXT NOT NULL,
            captured_at   TEXT NOT NULL,
            message       TEXT,
            material_json TEXT NOT NULL,
            UNIQUE(material_url, stage)
        )"
    )
}
