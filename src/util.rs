use chrono::Local;
use std::future::Future;
use std::io::Write;

pub fn init_logger() {
    let env = env_logger::Env::default()
        .filter_or(env_logger::DEFAULT_FILTER_ENV, "info");
    env_logger::Builder::from_env(env)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {} - {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                buf.default_styled_level(record.level()),
                &record.args()
            )
        })
        .init();
    log::info!("env_logger initialized.");
}

pub fn spawn_and_log_error<F>(fut: F) -> smol::Task<()>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    smol::spawn(async move {
        if let Err(e) = fut.await {
            log::error!("{}", e);
        }
    })
}
