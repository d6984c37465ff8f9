use sqlx::{Postgres, Transaction};

/// A job row committed together with the writes that justify it; a
/// background runner picks it up and delivers later.
#[derive(Debug, Clone)]
pub struct StagedJob {
    pub name: String,
    pub args: serde_json::Value,
}

/// Inserts the job in the caller's transaction. If that transaction rolls
/// back, the job was never staged.
pub async fn enqueue(
    tx: &mut Transaction<'_, Postgres>,
    job: &StagedJob,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO staged_jobs (job_name, job_args, created_at) VALUES ($1, $2, now())")
        .bind(&job.name)
        .bind(&job.args)
        .execute(&mut **tx)
        .await?;
    Ok(())
}
