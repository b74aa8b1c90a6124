//! Users, role capabilities, and the audit log

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::{fmt_datetime, parse_datetime, Database};
use crate::error::{Error, Result};
use crate::models::{Role, User};

/// Well-known email for the engine's bot identity, seeded on first use.
pub const BOT_EMAIL: &str = "bots@sitebook.internal";

fn row_to_user(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
        email: row.get(1)?,
        name: row.get(2)?,
        role: row.get::<_, String>(3)?.parse().unwrap_or(Role::Bookkeeper),
        password_hash: row.get(4)?,
        created_at: parse_datetime(&row.get::<_, String>(5)?),
    })
}

const USER_COLS: &str = "id, email, name, role, password_hash, created_at";

impl Database {
    pub fn create_user(
        &self,
        email: &str,
        name: &str,
        role: Role,
        password_hash: Option<&str>,
    ) -> Result<Uuid> {
        if email.trim().is_empty() || !email.contains('@') {
            return Err(Error::Validation(format!("Invalid email: '{}'", email)));
        }
        let id = Uuid::new_v4();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (id, email, name, role, password_hash, created_at) VALUES (?, ?, ?, ?, ?, ?)",
            params![
                id.to_string(),
                email.to_lowercase(),
                name,
                role.as_str(),
                password_hash,
                fmt_datetime(Utc::now()),
            ],
        )?;
        Ok(id)
    }

    pub fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        let conn = self.conn()?;
        let user = conn
            .query_row(
                &format!("SELECT {} FROM users WHERE id = ?", USER_COLS),
                params![id.to_string()],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let conn = self.conn()?;
        let user = conn
            .query_row(
                &format!("SELECT {} FROM users WHERE email = ?", USER_COLS),
                params![email.to_lowercase()],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    /// The shared bot identity used by agents and the auto-auth engine.
    /// Created on first access.
    pub fn bot_user_id(&self) -> Result<Uuid> {
        if let Some(user) = self.get_user_by_email(BOT_EMAIL)? {
            return Ok(user.id);
        }
        self.create_user(BOT_EMAIL, "Sitebook Bots", Role::Bot, None)
    }

    /// Raw capability rows for a role.
    pub fn role_capabilities(&self, role: Role) -> Result<Vec<(String, String)>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT module, action FROM role_capabilities WHERE role = ?")?;
        let rows = stmt
            .query_map(params![role.as_str()], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn grant_capability(&self, role: Role, module: &str, action: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO role_capabilities (role, module, action) VALUES (?, ?, ?)",
            params![role.as_str(), module, action],
        )?;
        Ok(())
    }

    /// Seed the default capability matrix. Idempotent.
    pub fn seed_default_capabilities(&self) -> Result<()> {
        use Role::*;
        let grants: &[(Role, &str, &str)] = &[
            (Admin, "*", "*"),
            (Bookkeeper, "expenses", "read"),
            (Bookkeeper, "expenses", "create"),
            (Bookkeeper, "expenses", "update"),
            (Bookkeeper, "receipts", "read"),
            (Bookkeeper, "receipts", "upload"),
            (Bookkeeper, "receipts", "process"),
            (Bookkeeper, "messages", "read"),
            (Bookkeeper, "messages", "post"),
            (ProjectManager, "expenses", "read"),
            (ProjectManager, "expenses", "status"),
            (ProjectManager, "receipts", "read"),
            (ProjectManager, "receipts", "upload"),
            (ProjectManager, "autoauth", "run"),
            (ProjectManager, "messages", "read"),
            (ProjectManager, "messages", "post"),
            (AccountingManager, "expenses", "read"),
            (AccountingManager, "expenses", "create"),
            (AccountingManager, "expenses", "update"),
            (AccountingManager, "expenses", "status"),
            (AccountingManager, "expenses", "delete"),
            (AccountingManager, "receipts", "read"),
            (AccountingManager, "receipts", "upload"),
            (AccountingManager, "receipts", "process"),
            (AccountingManager, "autoauth", "run"),
            (AccountingManager, "reports", "read"),
            (AccountingManager, "messages", "read"),
            (AccountingManager, "messages", "post"),
            (Bot, "expenses", "read"),
            (Bot, "expenses", "status"),
            (Bot, "receipts", "read"),
            (Bot, "receipts", "process"),
            (Bot, "autoauth", "run"),
            (Bot, "messages", "read"),
            (Bot, "messages", "post"),
        ];
        for (role, module, action) in grants {
            self.grant_capability(*role, module, action)?;
        }
        Ok(())
    }

    /// Append an audit row. Every capability-gated access goes through here.
    pub fn log_audit(
        &self,
        user_id: Uuid,
        action: &str,
        entity_type: Option<&str>,
        entity_id: Option<&str>,
        details: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO audit_log (user_id, action, entity_type, entity_id, details, created_at) VALUES (?, ?, ?, ?, ?, ?)",
            params![
                user_id.to_string(),
                action,
                entity_type,
                entity_id,
                details,
                fmt_datetime(Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Recent audit rows, newest first.
    pub fn list_audit_log(
        &self,
        limit: i64,
    ) -> Result<Vec<(i64, Uuid, String, Option<String>, Option<String>)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, user_id, action, entity_type, details FROM audit_log
             ORDER BY id DESC LIMIT ?
            "#,
        )?;
        let rows = stmt
            .query_map(params![limit.clamp(1, 1000)], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|(id, uid, action, et, details)| {
                (
                    id,
                    Uuid::parse_str(&uid).unwrap_or_default(),
                    action,
                    et,
                    details,
                )
            })
            .collect())
    }
}
