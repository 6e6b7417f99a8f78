use crate::app_config::AppConfig;
use reqwest::Client;

pub fn new_client(config: &AppConfig) -> Result<Client, reqwest::Error> {
    Client::builder()
        .danger_accept_invalid_certs(config.server().skip_verify())
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{DeviceApi, HttpDeviceApi};
    use crate::app_config::AppConfigBuilder;

    #[tokio::test]
    async fn device_calls_carry_the_fleet_stress_user_agent() -> Result<(), Box<dyn std::error::Error>> {
        let mut server = mockito::Server::new_async().await;
        let artifact = server
            .mock("GET", "/artifacts/v2")
            .match_header("user-agent", concat!("fleet-stress/", env!("CARGO_PKG_VERSION")))
            .with_body("0123456789")
            .create_async()
            .await;

        let config = AppConfigBuilder::new().server_url(server.url()).build();
        let api = HttpDeviceApi::new(new_client(&config)?, config.server().url());

        let bytes = api.download(&format!("{}/artifacts/v2", server.url())).await?;

        assert_eq!(bytes, 10);
        artifact.assert_async().await;
        Ok(())
    }
}
