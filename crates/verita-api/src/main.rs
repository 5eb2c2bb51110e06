use verita_core::Config;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = Config::from_env()?;

    let (state, router) = verita_api::setup::initialize_app(config).await?;

    verita_api::setup::server::start_server(state, router).await?;

    Ok(())
}
