//! 会话协议集成测试
//!
//! 覆盖登录、令牌轮换、复用检测、登出幂等和登录限流；
//! 需要 TEST_DATABASE_URL 指向可用的 PostgreSQL

use indicator_auth::{
    auth::jwt::JwtService,
    error::AppError,
    models::auth::{LoginRequest, RefreshTokenRequest},
    repository::TokenRepository,
};
use serial_test::serial;

mod common;
use common::{create_test_auth_service, create_test_user, setup_test_db};

const CLIENT_IP: &str = "198.51.100.7";

#[tokio::test]
#[serial]
async fn test_login_issues_active_refresh_token() {
    let config = common::create_test_config();
    let pool = setup_test_db(&config).await;
    create_test_user(&pool, "alice", "Corr3ct!pass", "alice@example.com").await;

    let service = create_test_auth_service(pool.clone()).await;

    let response = service
        .login(
            LoginRequest {
                identifier: "alice".to_string(),
                password: "Corr3ct!pass".to_string(),
            },
            CLIENT_IP,
            Some("test-agent"),
        )
        .await
        .expect("Login should succeed");

    assert!(!response.access_token.is_empty());
    assert_eq!(response.user.username, "alice");

    // 账本里能找到该令牌且处于活跃状态
    let jwt_service = JwtService::from_config(&config).unwrap();
    let digest = jwt_service.refresh_token_digest(&response.refresh_token);
    let record = TokenRepository::new(pool)
        .find_by_digest(&digest)
        .await
        .unwrap()
        .expect("Ledger record should exist");

    assert!(record.is_active());
    assert_eq!(record.client_context.as_deref(), Some("test-agent"));
}

#[tokio::test]
#[serial]
async fn test_login_by_email_identifier() {
    let config = common::create_test_config();
    let pool = setup_test_db(&config).await;
    create_test_user(&pool, "alice", "Corr3ct!pass", "alice@example.com").await;

    let service = create_test_auth_service(pool).await;

    let response = service
        .login(
            LoginRequest {
                identifier: "alice@example.com".to_string(),
                password: "Corr3ct!pass".to_string(),
            },
            CLIENT_IP,
            None,
        )
        .await
        .expect("Login by email should succeed");

    assert_eq!(response.user.username, "alice");
}

#[tokio::test]
#[serial]
async fn test_login_wrong_password_is_unauthorized() {
    let config = common::create_test_config();
    let pool = setup_test_db(&config).await;
    create_test_user(&pool, "alice", "Corr3ct!pass", "alice@example.com").await;

    let service = create_test_auth_service(pool).await;

    let err = service
        .login(
            LoginRequest {
                identifier: "alice".to_string(),
                password: "Wr0ng!pass".to_string(),
            },
            CLIENT_IP,
            None,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Unauthorized));
}

#[tokio::test]
#[serial]
async fn test_refresh_rotates_and_revokes_old_token() {
    let config = common::create_test_config();
    let pool = setup_test_db(&config).await;
    create_test_user(&pool, "alice", "Corr3ct!pass", "alice@example.com").await;

    let service = create_test_auth_service(pool.clone()).await;
    let login = service
        .login(
            LoginRequest {
                identifier: "alice".to_string(),
                password: "Corr3ct!pass".to_string(),
            },
            CLIENT_IP,
            Some("test-agent"),
        )
        .await
        .unwrap();

    let pair = service
        .refresh(
            RefreshTokenRequest {
                refresh_token: login.refresh_token.clone(),
            },
            CLIENT_IP,
        )
        .await
        .expect("First refresh should succeed");

    assert_ne!(pair.refresh_token, login.refresh_token);

    // 旧记录已撤销并链接到后继
    let jwt_service = JwtService::from_config(&config).unwrap();
    let repo = TokenRepository::new(pool);

    let old = repo
        .find_by_digest(&jwt_service.refresh_token_digest(&login.refresh_token))
        .await
        .unwrap()
        .unwrap();
    let new_digest = jwt_service.refresh_token_digest(&pair.refresh_token);

    assert!(old.is_revoked());
    assert_eq!(old.replaced_by.as_deref(), Some(new_digest.as_str()));

    // 后继继承了客户端上下文并处于活跃状态
    let successor = repo.find_by_digest(&new_digest).await.unwrap().unwrap();
    assert!(successor.is_active());
    assert_eq!(successor.client_context.as_deref(), Some("test-agent"));
}

#[tokio::test]
#[serial]
async fn test_second_refresh_is_reuse_and_kills_chain() {
    let config = common::create_test_config();
    let pool = setup_test_db(&config).await;
    create_test_user(&pool, "alice", "Corr3ct!pass", "alice@example.com").await;

    let service = create_test_auth_service(pool.clone()).await;
    let login = service
        .login(
            LoginRequest {
                identifier: "alice".to_string(),
                password: "Corr3ct!pass".to_string(),
            },
            CLIENT_IP,
            None,
        )
        .await
        .unwrap();

    let pair = service
        .refresh(
            RefreshTokenRequest {
                refresh_token: login.refresh_token.clone(),
            },
            CLIENT_IP,
        )
        .await
        .unwrap();

    // 已消费的令牌再次出现 → 复用检测
    let err = service
        .refresh(
            RefreshTokenRequest {
                refresh_token: login.refresh_token.clone(),
            },
            CLIENT_IP,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ReuseDetected));

    // 第一次轮换产出的后继也被整链撤销
    let jwt_service = JwtService::from_config(&config).unwrap();
    let successor = TokenRepository::new(pool)
        .find_by_digest(&jwt_service.refresh_token_digest(&pair.refresh_token))
        .await
        .unwrap()
        .unwrap();
    assert!(successor.is_revoked());

    // 后继此后也无法使用
    let err = service
        .refresh(
            RefreshTokenRequest {
                refresh_token: pair.refresh_token,
            },
            CLIENT_IP,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ReuseDetected));
}

#[tokio::test]
#[serial]
async fn test_concurrent_refresh_has_single_winner() {
    let config = common::create_test_config();
    let pool = setup_test_db(&config).await;
    create_test_user(&pool, "alice", "Corr3ct!pass", "alice@example.com").await;

    let service = create_test_auth_service(pool).await;
    let login = service
        .login(
            LoginRequest {
                identifier: "alice".to_string(),
                password: "Corr3ct!pass".to_string(),
            },
            CLIENT_IP,
            None,
        )
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        service.refresh(
            RefreshTokenRequest {
                refresh_token: login.refresh_token.clone(),
            },
            CLIENT_IP,
        ),
        service.refresh(
            RefreshTokenRequest {
                refresh_token: login.refresh_token.clone(),
            },
            CLIENT_IP,
        ),
    );

    // 同一令牌的两次并发刷新绝不能都成功
    let successes = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1);

    let loser = if a.is_ok() { b } else { a };
    assert!(matches!(
        loser.unwrap_err(),
        AppError::ReuseDetected | AppError::SessionExpired
    ));
}

#[tokio::test]
#[serial]
async fn test_expired_refresh_token_fails_expired() {
    let config = common::create_test_config();
    let pool = setup_test_db(&config).await;
    let user_id = create_test_user(&pool, "alice", "Corr3ct!pass", "alice@example.com").await;

    // 手工落一条刚好过期的账本记录（边界取闭区间）
    let jwt_service = JwtService::from_config(&config).unwrap();
    let value = JwtService::generate_refresh_value();
    sqlx::query(
        r#"
        INSERT INTO refresh_tokens (id, token_hash, user_id, issued_at, expires_at)
        VALUES ($1, $2, $3, NOW() - INTERVAL '1 hour', NOW())
        "#,
    )
    .bind(uuid::Uuid::new_v4())
    .bind(jwt_service.refresh_token_digest(&value))
    .bind(user_id)
    .execute(&pool)
    .await
    .unwrap();

    let service = create_test_auth_service(pool).await;
    let err = service
        .refresh(
            RefreshTokenRequest {
                refresh_token: value,
            },
            CLIENT_IP,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::SessionExpired));
}

#[tokio::test]
#[serial]
async fn test_unknown_refresh_token_fails_invalid() {
    let config = common::create_test_config();
    let pool = setup_test_db(&config).await;

    let service = create_test_auth_service(pool).await;
    let err = service
        .refresh(
            RefreshTokenRequest {
                refresh_token: JwtService::generate_refresh_value(),
            },
            CLIENT_IP,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::InvalidRefreshToken));
}

#[tokio::test]
#[serial]
async fn test_logout_is_idempotent() {
    let config = common::create_test_config();
    let pool = setup_test_db(&config).await;
    create_test_user(&pool, "alice", "Corr3ct!pass", "alice@example.com").await;

    let service = create_test_auth_service(pool).await;
    let login = service
        .login(
            LoginRequest {
                identifier: "alice".to_string(),
                password: "Corr3ct!pass".to_string(),
            },
            CLIENT_IP,
            None,
        )
        .await
        .unwrap();

    service.logout(&login.refresh_token).await.unwrap();
    // 第二次登出同样成功
    service.logout(&login.refresh_token).await.unwrap();
    // 从未签发过的令牌登出也成功
    service.logout("never-issued-token").await.unwrap();

    // 登出后的令牌无法再刷新
    let err = service
        .refresh(
            RefreshTokenRequest {
                refresh_token: login.refresh_token,
            },
            CLIENT_IP,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ReuseDetected));
}

#[tokio::test]
#[serial]
async fn test_rate_limiter_blocks_before_credential_store() {
    let config = common::create_test_config();
    let pool = setup_test_db(&config).await;
    create_test_user(&pool, "alice", "Corr3ct!pass", "alice@example.com").await;

    let service = create_test_auth_service(pool).await;

    // 窗口内 5 次失败
    for _ in 0..5 {
        let err = service
            .login(
                LoginRequest {
                    identifier: "alice".to_string(),
                    password: "Wr0ng!pass".to_string(),
                },
                CLIENT_IP,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Unauthorized));
    }

    // 第 6 次即使密码正确也被限流：检查发生在凭证存储之前
    let err = service
        .login(
            LoginRequest {
                identifier: "alice".to_string(),
                password: "Corr3ct!pass".to_string(),
            },
            CLIENT_IP,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::RateLimitExceeded));
}

#[tokio::test]
#[serial]
async fn test_disabled_account_cannot_login_or_refresh() {
    let config = common::create_test_config();
    let pool = setup_test_db(&config).await;
    create_test_user(&pool, "alice", "Corr3ct!pass", "alice@example.com").await;

    let service = create_test_auth_service(pool.clone()).await;
    let login = service
        .login(
            LoginRequest {
                identifier: "alice".to_string(),
                password: "Corr3ct!pass".to_string(),
            },
            CLIENT_IP,
            None,
        )
        .await
        .unwrap();

    sqlx::query("UPDATE users SET status = 'disabled' WHERE username = 'alice'")
        .execute(&pool)
        .await
        .unwrap();

    // 与未知用户不可区分
    let err = service
        .login(
            LoginRequest {
                identifier: "alice".to_string(),
                password: "Corr3ct!pass".to_string(),
            },
            "198.51.100.8",
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Unauthorized));

    // 已发出的刷新令牌也随之失效
    let err = service
        .refresh(
            RefreshTokenRequest {
                refresh_token: login.refresh_token,
            },
            CLIENT_IP,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Unauthorized));
}

#[tokio::test]
#[serial]
async fn test_logout_all_revokes_every_session() {
    let config = common::create_test_config();
    let pool = setup_test_db(&config).await;
    let user_id = create_test_user(&pool, "alice", "Corr3ct!pass", "alice@example.com").await;

    let service = create_test_auth_service(pool).await;

    let login_a = service
        .login(
            LoginRequest {
                identifier: "alice".to_string(),
                password: "Corr3ct!pass".to_string(),
            },
            CLIENT_IP,
            Some("device-a"),
        )
        .await
        .unwrap();
    let login_b = service
        .login(
            LoginRequest {
                identifier: "alice".to_string(),
                password: "Corr3ct!pass".to_string(),
            },
            CLIENT_IP,
            Some("device-b"),
        )
        .await
        .unwrap();

    let revoked = service.logout_all(user_id).await.unwrap();
    assert_eq!(revoked, 2);

    for token in [login_a.refresh_token, login_b.refresh_token] {
        let err = service
            .refresh(
                RefreshTokenRequest {
                    refresh_token: token,
                },
                CLIENT_IP,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ReuseDetected));
    }
}
