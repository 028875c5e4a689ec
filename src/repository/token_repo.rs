//! Refresh token ledger (刷新令牌账本)
//!
//! 账本是唯一的共享可变资源：每个变更都是对存储的单次原子交互。
//! 轮换的撤销步骤用 `revoked_at IS NULL` 条件更新实现 CAS，
//! 并发的两次轮换最多一个成功。

use crate::{error::AppError, models::auth::RefreshToken};
use sqlx::PgPool;

pub struct TokenRepository {
    db: PgPool,
}

impl TokenRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// 存储刷新令牌
    pub async fn store(&self, token: &RefreshToken) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (
                id, token_hash, user_id, client_context, issued_at, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(token.id)
        .bind(&token.token_hash)
        .bind(token.user_id)
        .bind(&token.client_context)
        .bind(token.issued_at)
        .bind(token.expires_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// 根据摘要查找刷新令牌
    pub async fn find_by_digest(&self, token_hash: &str) -> Result<Option<RefreshToken>, AppError> {
        let token =
            sqlx::query_as::<_, RefreshToken>("SELECT * FROM refresh_tokens WHERE token_hash = $1")
                .bind(token_hash)
                .fetch_optional(&self.db)
                .await?;

        Ok(token)
    }

    /// 轮换：撤销旧令牌、链接后继并落库后继，整体在一个事务内
    ///
    /// 返回 false 表示旧令牌在读取与写入之间已被别人撤销（轮换竞争失败），
    /// 此时后继不会被写入，调用方必须走复用检测路径
    pub async fn rotate(&self, old: &RefreshToken, successor: &RefreshToken) -> Result<bool, AppError> {
        let mut tx = self.db.begin().await?;

        let revoked = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET revoked_at = NOW(), replaced_by = $2
            WHERE id = $1 AND revoked_at IS NULL
            "#,
        )
        .bind(old.id)
        .bind(&successor.token_hash)
        .execute(&mut *tx)
        .await?;

        if revoked.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (
                id, token_hash, user_id, client_context, issued_at, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(successor.id)
        .bind(&successor.token_hash)
        .bind(successor.user_id)
        .bind(&successor.client_context)
        .bind(successor.issued_at)
        .bind(successor.expires_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(true)
    }

    /// 按摘要撤销（登出用，不产生后继）
    ///
    /// 幂等：令牌不存在或已撤销时返回 false，不报错
    pub async fn revoke_by_digest(&self, token_hash: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked_at = NOW() WHERE token_hash = $1 AND revoked_at IS NULL",
        )
        .bind(token_hash)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// 沿 replaced_by 链向前撤销所有后代，返回本次实际撤销的数量
    ///
    /// 已撤销的节点也继续往后走：复用检测的起点本身就是已撤销的
    pub async fn revoke_chain(&self, start_hash: &str) -> Result<u64, AppError> {
        let mut revoked = 0u64;
        let mut cursor = Some(start_hash.to_string());

        while let Some(hash) = cursor.take() {
            let next: Option<Option<String>> =
                sqlx::query_scalar("SELECT replaced_by FROM refresh_tokens WHERE token_hash = $1")
                    .bind(&hash)
                    .fetch_optional(&self.db)
                    .await?;

            let Some(next) = next else { break };

            let result = sqlx::query(
                "UPDATE refresh_tokens SET revoked_at = NOW() WHERE token_hash = $1 AND revoked_at IS NULL",
            )
            .bind(&hash)
            .execute(&self.db)
            .await?;
            revoked += result.rows_affected();

            cursor = next;
        }

        Ok(revoked)
    }

    /// 撤销用户的所有刷新令牌（从所有设备登出）
    pub async fn revoke_all_for_user(&self, user_id: uuid::Uuid) -> Result<u64, AppError> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked_at = NOW() WHERE user_id = $1 AND revoked_at IS NULL",
        )
        .bind(user_id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    /// 清理过期令牌（留给外部保留策略任务调用，协议本身从不硬删除）
    pub async fn cleanup_expired(&self) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at < NOW()")
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected())
    }
}
