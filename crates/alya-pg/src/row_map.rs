//! Row-to-entity mapping.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::Row;

use alya_core::types::{Batch, BatchRow, ClaimedRow};

pub(crate) fn batch_from_row(row: &PgRow) -> Result<Batch> {
    let status: String = row.try_get("status")?;
    let outputfiles: Option<Value> = row.try_get("outputfiles")?;
    Ok(Batch {
        id: row.try_get("id")?,
        app: row.try_get("app")?,
        op: row.try_get("op")?,
        context: row.try_get("context")?,
        inputfile: row.try_get("inputfile")?,
        status: status.parse()?,
        reqat: row.try_get("reqat")?,
        doneat: row.try_get("doneat")?,
        outputfiles: outputfiles
            .map(serde_json::from_value)
            .transpose()
            .context("batch outputfiles column is not a name-to-object mapping")?,
        nsuccess: row.try_get("nsuccess")?,
        nfailed: row.try_get("nfailed")?,
        naborted: row.try_get("naborted")?,
    })
}

pub(crate) fn batch_row_from_row(row: &PgRow) -> Result<BatchRow> {
    let status: String = row.try_get("status")?;
    let blobrows: Option<Value> = row.try_get("blobrows")?;
    let messages: Option<Value> = row.try_get("messages")?;
    Ok(BatchRow {
        rowid: row.try_get("rowid")?,
        batch: row.try_get("batch")?,
        line: row.try_get("line")?,
        input: row.try_get("input")?,
        status: status.parse()?,
        reqat: row.try_get("reqat")?,
        doneat: row.try_get("doneat")?,
        res: row.try_get("res")?,
        blobrows: blobrows
            .map(serde_json::from_value)
            .transpose()
            .context("row blobrows column is not a name-to-text mapping")?,
        messages: messages
            .map(serde_json::from_value)
            .transpose()
            .context("row messages column is not a message list")?,
        doneby: row.try_get("doneby")?,
    })
}

pub(crate) fn claimed_row_from_row(row: &PgRow) -> Result<ClaimedRow> {
    let status: String = row.try_get("status")?;
    Ok(ClaimedRow {
        app: row.try_get("app")?,
        op: row.try_get("op")?,
        context: row.try_get("context")?,
        batch: row.try_get("batch")?,
        rowid: row.try_get("rowid")?,
        line: row.try_get("line")?,
        input: row.try_get("input")?,
        status: status.parse()?,
    })
}
