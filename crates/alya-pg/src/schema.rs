//! Reference DDL for the two engine tables.
//!
//! Schema evolution is owned by an external migration tool; this constant
//! exists so tests and local deployments can bootstrap a database.

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS batches (
    id          TEXT PRIMARY KEY,
    app         TEXT NOT NULL,
    op          TEXT NOT NULL,
    context     JSONB NOT NULL,
    inputfile   TEXT,
    status      TEXT NOT NULL
                CHECK (status IN ('queued', 'inprog', 'wait', 'success', 'failed', 'aborted')),
    reqat       TIMESTAMPTZ NOT NULL,
    doneat      TIMESTAMPTZ,
    outputfiles JSONB,
    nsuccess    INTEGER,
    nfailed     INTEGER,
    naborted    INTEGER
);

CREATE TABLE IF NOT EXISTS batchrows (
    rowid    BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    batch    TEXT NOT NULL REFERENCES batches (id),
    line     INTEGER NOT NULL,
    input    JSONB NOT NULL,
    status   TEXT NOT NULL
             CHECK (status IN ('queued', 'inprog', 'success', 'failed', 'aborted')),
    reqat    TIMESTAMPTZ NOT NULL,
    doneat   TIMESTAMPTZ,
    res      JSONB,
    blobrows JSONB,
    messages JSONB,
    doneby   TEXT
);

CREATE INDEX IF NOT EXISTS idx_batchrows_status ON batchrows (status);
CREATE INDEX IF NOT EXISTS idx_batchrows_batch ON batchrows (batch);
CREATE INDEX IF NOT EXISTS idx_batches_unsummarized ON batches (status) WHERE doneat IS NULL;
"#;
