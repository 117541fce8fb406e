use queuework_core::Config;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = Config::from_env()?;

    let app = queuework_api::setup::initialize_app(config.clone()).await?;

    queuework_api::setup::server::start_server(&config, app).await?;

    Ok(())
}
