//! Space, user, and membership repositories.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tracing::info;
use uuid::Uuid;

use notely_core::defaults::PERSONAL_SPACE_NAME;
use notely_core::{new_v7, DomainError, Error, NewUser, Result, Space, SpaceReader, User};

use crate::writer::map_constraint;

pub(crate) const SPACE_COLUMNS: &str = "id, name, creator, personal, created";
const USER_COLUMNS: &str = "id, tg_id, username, personal_space_id, created";

pub(crate) fn parse_space_row(row: &PgRow) -> Space {
    Space {
        id: row.get("id"),
        name: row.get("name"),
        creator: row.get("creator"),
        personal: row.get("personal"),
        created: row.get("created"),
    }
}

fn parse_user_row(row: &PgRow) -> User {
    User {
        id: row.get("id"),
        tg_id: row.get("tg_id"),
        username: row.get("username"),
        personal_space_id: row.get("personal_space_id"),
        created: row.get("created"),
    }
}

/// PostgreSQL read access to spaces, users, and membership.
#[derive(Clone)]
pub struct PgSpaceRepository {
    pool: Pool<Postgres>,
}

impl PgSpaceRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SpaceReader for PgSpaceRepository {
    async fn get_space(&self, space_id: Uuid) -> Result<Option<Space>> {
        let row = sqlx::query(&format!("SELECT {SPACE_COLUMNS} FROM space WHERE id = $1"))
            .bind(space_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(row.as_ref().map(parse_space_row))
    }

    async fn get_user(&self, user_id: i64) -> Result<Option<User>> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(row.as_ref().map(parse_user_row))
    }

    async fn get_user_by_tg_id(&self, tg_id: i64) -> Result<Option<User>> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE tg_id = $1"))
            .bind(tg_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(row.as_ref().map(parse_user_row))
    }

    async fn is_participant(&self, space_id: Uuid, user_id: i64) -> Result<bool> {
        let (member,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (
                 SELECT 1 FROM space WHERE id = $1 AND creator = $2
                 UNION ALL
                 SELECT 1 FROM space_participant WHERE space_id = $1 AND user_id = $2
             )",
        )
        .bind(space_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(member)
    }
}

/// User provisioning.
///
/// Registration happens outside the command pipeline: a user and their
/// personal space are created together in one transaction.
#[derive(Clone)]
pub struct PgUserRepository {
    pool: Pool<Postgres>,
}

impl PgUserRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub async fn register(&self, new_user: NewUser) -> Result<User> {
        let now = Utc::now();
        let space_id = new_v7();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // personal_space_fkey is deferred, so the user row can come first.
        let row = sqlx::query(&format!(
            "INSERT INTO users (tg_id, username, personal_space_id, created)
             VALUES ($1, $2, $3, $4)
             RETURNING {USER_COLUMNS}"
        ))
        .bind(new_user.tg_id)
        .bind(&new_user.username)
        .bind(space_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            map_constraint(e, |constraint| match constraint {
                "users_tg_id_key" => Some(DomainError::UserAlreadyExists(new_user.tg_id)),
                _ => None,
            })
        })?;
        let user = parse_user_row(&row);

        sqlx::query(
            "INSERT INTO space (id, name, creator, personal, created) VALUES ($1, $2, $3, TRUE, $4)",
        )
        .bind(space_id)
        .bind(PERSONAL_SPACE_NAME)
        .bind(user.id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        sqlx::query("INSERT INTO space_participant (space_id, user_id, joined) VALUES ($1, $2, $3)")
            .bind(space_id)
            .bind(user.id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "database",
            component = "users",
            op = "register",
            user_id = user.id,
            tg_id = user.tg_id,
            space_id = %space_id,
            "User registered with personal space"
        );
        Ok(user)
    }
}
