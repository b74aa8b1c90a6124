//! Command implementations

use anyhow::{bail, Context, Result};
use tracing::info;
use uuid::Uuid;

use sitebook_core::autoauth::AutoAuthEngine;
use sitebook_core::classifier::Classifier;
use sitebook_core::models::Role;
use sitebook_core::{Config, Database, LlmClient};
use sitebook_server::AppState;

fn open_db(config: &Config) -> Result<Database> {
    Database::new(&config.db_path)
        .with_context(|| format!("Failed to open database at {}", config.db_path))
}

pub fn cmd_init() -> Result<()> {
    let config = Config::from_env();
    let db = open_db(&config)?;
    db.seed_default_capabilities()?;
    db.bot_user_id()?;
    info!("Database initialized at {}", config.db_path);
    Ok(())
}

pub async fn cmd_serve(host: &str, port: u16) -> Result<()> {
    let config = Config::from_env();
    let db = open_db(&config)?;

    let llm = LlmClient::from_config(&config, Some(db.clone()));
    match &llm {
        Some(client) => {
            use sitebook_core::LlmBackend;
            info!(
                "LLM gateway configured (small: {}, large: {})",
                client.small_model(),
                client.large_model()
            );
        }
        None => info!("LLM gateway not configured (set SITEBOOK_LLM_API_KEY to enable AI tiers)"),
    }

    let state = AppState::build(db, config, llm);
    sitebook_server::serve(state, host, port).await
}

pub fn cmd_add_user(email: &str, name: &str, role: &str, password: &str) -> Result<()> {
    use argon2::password_hash::{rand_core::OsRng, SaltString};
    use argon2::{Argon2, PasswordHasher};

    let role: Role = role.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    if password.len() < 12 {
        bail!("Password must be at least 12 characters");
    }

    let config = Config::from_env();
    let db = open_db(&config)?;
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Password hashing failed: {}", e))?
        .to_string();

    let id = db.create_user(email, name, role, Some(&hash))?;
    info!("Created {} user {} ({})", role, email, id);
    Ok(())
}

pub async fn cmd_autoauth(project: &str, digest: bool) -> Result<()> {
    let project_id: Uuid = project.parse().context("Invalid project id")?;
    let config = Config::from_env();
    let db = open_db(&config)?;
    let engine = AutoAuthEngine::new(db, config);

    let outcome = engine.run(project_id, None, false).await?;
    println!(
        "Run {}: {} authorized (${}), {} duplicates, {} missing info, {} escalated",
        outcome.run_id,
        outcome.summary.authorized,
        outcome.summary.authorized_amount,
        outcome.summary.duplicates,
        outcome.summary.missing_info,
        outcome.summary.escalated,
    );
    for d in &outcome.decisions {
        println!("  [{}] {} {} - {}", d.rule, d.decision, d.expense_id, d.reason);
    }

    if digest {
        let flushed = engine.flush_digest(project_id)?;
        println!("Digest flushed ({} report(s))", flushed);
    }
    Ok(())
}

pub fn cmd_train() -> Result<()> {
    let config = Config::from_env();
    let db = open_db(&config)?;
    let classifier = Classifier::new(config.retrain_interval_hours);
    classifier.train(&db)?;
    let status = classifier.status();
    if status.is_trained {
        println!(
            "Trained: {} rows, {} features (version {})",
            status.training_size, status.feature_count, status.version
        );
    } else {
        println!("Not trained: insufficient verified history");
    }
    Ok(())
}

pub fn cmd_sweep() -> Result<()> {
    let config = Config::from_env();
    let db = open_db(&config)?;
    let removed = db.cache_sweep(config.cache_ttl_days)?;
    println!("Removed {} stale cache entries", removed);
    Ok(())
}

pub fn cmd_status() -> Result<()> {
    let config = Config::from_env();
    let db = open_db(&config)?;

    let summary = db.summarize_by_status(&Default::default())?;
    println!("Expenses:");
    println!(
        "  pending     {:>6}  ${}",
        summary.pending.count, summary.pending.total
    );
    println!(
        "  authorized  {:>6}  ${}",
        summary.authorized.count, summary.authorized.total
    );
    println!(
        "  review      {:>6}  ${}",
        summary.review.count, summary.review.total
    );

    let (calls, successes, avg_ms) = db.ocr_metric_summary()?;
    println!(
        "OCR: {} calls, {} ok, avg {:.0}ms",
        calls, successes, avg_ms
    );

    let missing = db.expenses_missing_change_log()?;
    if !missing.is_empty() {
        println!(
            "WARNING: {} expense(s) updated without change-log rows",
            missing.len()
        );
    }
    Ok(())
}
