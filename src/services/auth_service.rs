//! 认证服务：注册、登录、登出、令牌轮换
//!
//! 会话协议的编排层。每个会话沿 Anonymous → Authenticated → Rotated* →
//! LoggedOut | Revoked 推进；已消费的刷新令牌再次出现视为令牌泄露，
//! 整条轮换链作废。

use crate::{
    auth::jwt::JwtService,
    auth::password::PasswordHasher,
    auth::rate_limit::LoginRateLimiter,
    config::AppConfig,
    error::AppError,
    models::{auth::*, user::*},
    repository::{TokenRepository, UserRepository},
};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

pub struct AuthService {
    db: PgPool,
    jwt_service: Arc<JwtService>,
    limiter: Arc<dyn LoginRateLimiter>,
    config: Arc<AppConfig>,
}

impl AuthService {
    pub fn new(
        db: PgPool,
        jwt_service: Arc<JwtService>,
        limiter: Arc<dyn LoginRateLimiter>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            db,
            jwt_service,
            limiter,
            config,
        }
    }

    /// 用户注册
    ///
    /// 密码策略在触达凭证存储之前校验
    pub async fn register(&self, req: RegisterRequest) -> Result<UserResponse, AppError> {
        req.validate()?;
        PasswordHasher::validate_password_policy(&req.password, &self.config.security)?;

        let user_repo = UserRepository::new(self.db.clone());

        if user_repo.identifier_taken(&req.username, &req.email).await? {
            return Err(AppError::DuplicateUsername);
        }

        let hasher = PasswordHasher::new();
        let password_hash = hasher.hash(&req.password)?;

        let user = user_repo.create(&req, &password_hash).await?;

        tracing::info!(user_id = %user.id, username = %user.username, "User registered");

        Ok(UserResponse::from(user))
    }

    /// 用户登录
    pub async fn login(
        &self,
        req: LoginRequest,
        client_ip: &str,
        user_agent: Option<&str>,
    ) -> Result<LoginResponse, AppError> {
        // 限流检查先于任何凭证存储读取
        self.limiter.check(client_ip)?;

        let user_repo = UserRepository::new(self.db.clone());

        // 未知用户、停用账户和密码错误必须不可区分，避免账号枚举
        let user = match user_repo.find_by_identifier(&req.identifier).await? {
            Some(user) if user.is_active() => user,
            _ => {
                self.limiter.record_failure(client_ip);
                tracing::debug!(%client_ip, "Login rejected: unknown or inactive account");
                return Err(AppError::Unauthorized);
            }
        };

        let hasher = PasswordHasher::new();
        if hasher.verify(&req.password, &user.password_hash).is_err() {
            self.limiter.record_failure(client_ip);
            tracing::debug!(user_id = %user.id, %client_ip, "Login rejected: bad password");
            return Err(AppError::Unauthorized);
        }

        self.limiter.reset(client_ip);

        // 签发令牌对
        let access_token = self.jwt_service.generate_access_token(
            &user.id,
            &user.username,
            user.roles.clone(),
        )?;

        let (refresh_value, record) =
            self.new_refresh_record(user.id, user_agent.map(|s| s.to_string()));

        TokenRepository::new(self.db.clone()).store(&record).await?;

        tracing::info!(user_id = %user.id, %client_ip, "User logged in");

        Ok(LoginResponse {
            access_token,
            refresh_token: refresh_value,
            expires_in: self.jwt_service.access_token_exp_secs(),
            user: UserResponse::from(user),
        })
    }

    /// 刷新令牌（轮换）
    ///
    /// 旧令牌撤销与后继写入是一次原子交换；竞争失败的一方走复用检测路径，
    /// 同一令牌的真实双花与被窃重放得到同样的处理
    pub async fn refresh(
        &self,
        req: RefreshTokenRequest,
        client_ip: &str,
    ) -> Result<TokenPair, AppError> {
        let token_repo = TokenRepository::new(self.db.clone());

        let digest = self.jwt_service.refresh_token_digest(&req.refresh_token);
        let record = token_repo
            .find_by_digest(&digest)
            .await?
            .ok_or(AppError::InvalidRefreshToken)?;

        // 已撤销的令牌再次出现：复用信号，整条链作废
        if record.is_revoked() {
            let revoked = token_repo.revoke_chain(&record.token_hash).await?;
            tracing::warn!(
                user_id = %record.user_id,
                %client_ip,
                revoked_descendants = revoked,
                "Revoked refresh token presented again, rotation chain invalidated"
            );
            return Err(AppError::ReuseDetected);
        }

        if record.is_expired() {
            return Err(AppError::SessionExpired);
        }

        // 账户必须仍然可用
        let user_repo = UserRepository::new(self.db.clone());
        let user = match user_repo.find_by_id(&record.user_id).await? {
            Some(user) if user.is_active() => user,
            _ => return Err(AppError::Unauthorized),
        };

        let (refresh_value, successor) =
            self.new_refresh_record(user.id, record.client_context.clone());

        if !token_repo.rotate(&record, &successor).await? {
            // 输掉了并发轮换：令牌刚被别人消费，按复用处理
            let revoked = token_repo.revoke_chain(&record.token_hash).await?;
            tracing::warn!(
                user_id = %record.user_id,
                %client_ip,
                revoked_descendants = revoked,
                "Concurrent use of one refresh token, rotation chain invalidated"
            );
            return Err(AppError::ReuseDetected);
        }

        let access_token = self.jwt_service.generate_access_token(
            &user.id,
            &user.username,
            user.roles.clone(),
        )?;

        tracing::debug!(user_id = %user.id, "Refresh token rotated");

        Ok(TokenPair {
            access_token,
            refresh_token: refresh_value,
            expires_in: self.jwt_service.access_token_exp_secs(),
        })
    }

    /// 登出（撤销刷新令牌，不产生后继）
    ///
    /// 对调用方永远成功：重复登出、登出已过期的会话都不是错误
    pub async fn logout(&self, refresh_token: &str) -> Result<(), AppError> {
        let digest = self.jwt_service.refresh_token_digest(refresh_token);

        let revoked = TokenRepository::new(self.db.clone())
            .revoke_by_digest(&digest)
            .await?;

        if revoked {
            tracing::debug!("Refresh token revoked on logout");
        }

        Ok(())
    }

    /// 从所有设备登出
    pub async fn logout_all(&self, user_id: Uuid) -> Result<u64, AppError> {
        let revoked = TokenRepository::new(self.db.clone())
            .revoke_all_for_user(user_id)
            .await?;

        tracing::info!(%user_id, revoked, "All sessions revoked");

        Ok(revoked)
    }

    /// 构造一条新的账本记录，返回（原始令牌值，记录）
    ///
    /// 原始值只在此刻存在，落库的是带密钥的摘要
    fn new_refresh_record(
        &self,
        user_id: Uuid,
        client_context: Option<String>,
    ) -> (String, RefreshToken) {
        let value = JwtService::generate_refresh_value();
        let now = chrono::Utc::now();

        let record = RefreshToken {
            id: Uuid::new_v4(),
            token_hash: self.jwt_service.refresh_token_digest(&value),
            user_id,
            client_context,
            issued_at: now,
            expires_at: now
                + chrono::Duration::seconds(self.config.security.refresh_token_exp_secs as i64),
            revoked_at: None,
            replaced_by: None,
        };

        (value, record)
    }
}
