use reqwest::Client;
use std::time::Duration;

/// Online check through lightweight HTTP probes, tried in order.
pub async fn check_online_status(probe_urls: &[String]) -> bool {
    let client = match Client::builder().timeout(Duration::from_secs(2)).build() {
        Ok(client) => client,
        Err(_) => return false,
    };

    for url in probe_urls {
        match client.get(url).send().await {
            Ok(response) if response.status().is_success() => return true,
            _ => continue,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_probes_means_offline() {
        assert!(!check_online_status(&[]).await);
    }
}
