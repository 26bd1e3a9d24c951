use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use secrecy::ExposeSecret;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use ashpaw::{
    config::Config,
    create_router,
    repositories::Stores,
    services::{ChannelProvider, WeComClient},
    state::AppState,
};

/// 期限切れデータの定期削除間隔
const PURGE_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ログ初期化（JSON形式、環境変数でレベル制御）
    init_tracing();

    tracing::info!("ashpaw 起動中...");

    // 設定読み込み
    let config = Config::load().map_err(|e| {
        tracing::error!(error = ?e, "設定の読み込みに失敗");
        anyhow::anyhow!("Failed to load config: {}", e)
    })?;

    tracing::info!(host = %config.host, port = %config.port, "設定読み込み完了");

    // サーバーアドレスを先に構築（config が move される前に）
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| {
            tracing::error!(error = ?e, "アドレスのパースに失敗");
            anyhow::anyhow!("Failed to parse address: {}", e)
        })?;

    let stores = build_stores(&config).await?;
    let provider = build_channel_provider(&config)?;

    // AppState 構築
    let state = AppState::new(stores, config, provider).map_err(|e| {
        tracing::error!(error = ?e, "AppState の構築に失敗");
        anyhow::anyhow!("Failed to create AppState: {}", e)
    })?;

    spawn_purge_task(state.clone());

    // Router 構築
    let app = create_router(state);

    // サーバー起動
    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        tracing::error!(error = ?e, addr = %addr, "ポートのバインドに失敗");
        anyhow::anyhow!("Failed to bind to {}: {}", addr, e)
    })?;

    tracing::info!(addr = %addr, "サーバー起動");

    // Graceful shutdown 対応
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| {
            tracing::error!(error = ?e, "サーバーエラー");
            anyhow::anyhow!("Server error: {}", e)
        })?;

    tracing::info!("サーバー終了");

    Ok(())
}

/// tracing の初期化（JSON形式）
fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,ashpaw=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// ストア構築（DATABASE_URL 未設定ならインメモリ）
async fn build_stores(config: &Config) -> anyhow::Result<Stores> {
    let Some(database_url) = config.database_url.as_ref() else {
        tracing::warn!("DATABASE_URL 未設定: インメモリストアで起動（開発用、再起動でデータ消失）");
        return Ok(Stores::in_memory());
    };

    // データベース接続プール作成
    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url.expose_secret())
        .await
        .map_err(|e| {
            tracing::error!(error = ?e, "データベース接続に失敗");
            anyhow::anyhow!("Failed to connect to database: {}", e)
        })?;

    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .map_err(|e| {
            tracing::error!(error = ?e, "マイグレーションに失敗");
            anyhow::anyhow!("Failed to run migrations: {}", e)
        })?;

    tracing::info!("データベース接続完了");

    Ok(Stores::postgres(db_pool))
}

/// 企業微信プロバイダ（3つ揃った場合のみ初期化）
fn build_channel_provider(config: &Config) -> anyhow::Result<Option<Arc<dyn ChannelProvider>>> {
    match (
        &config.wecom_corp_id,
        &config.wecom_agent_id,
        &config.wecom_secret,
    ) {
        (Some(corp_id), Some(agent_id), Some(secret)) => {
            tracing::info!("企業微信プロバイダを初期化");
            let client = WeComClient::new(
                corp_id.clone(),
                agent_id,
                secret.expose_secret().clone(),
            )
            .map_err(|e| anyhow::anyhow!("Failed to create WeCom client: {}", e))?;
            Ok(Some(Arc::new(client)))
        }
        _ => {
            tracing::info!("企業微信 未設定（チャネル連携は無効）");
            Ok(None)
        }
    }
}

/// 期限切れのプッシュ承認・ハンドオフ台帳を定期削除
fn spawn_purge_task(state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            interval.tick().await;
            match state.purge_expired().await {
                Ok((approvals, redemptions)) => {
                    tracing::debug!(approvals, redemptions, "期限切れデータ削除");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "期限切れデータ削除に失敗");
                }
            }
        }
    });
}

/// Graceful shutdown シグナル待機
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = ?e, "Ctrl+C ハンドラーのインストールに失敗");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = ?e, "SIGTERM ハンドラーのインストールに失敗");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Ctrl+C received, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("SIGTERM received, starting graceful shutdown");
        }
    }
}
