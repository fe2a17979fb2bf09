//! Digest rendering and delivery for RCW.

use askama::Template;
use async_trait::async_trait;
use rcw_core::{group_by_category, notifiable_above, RewardProduct};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "rcw-notify";

pub const DEFAULT_IMAGE_BASE: &str = "https://www.sephora.com";

#[derive(Template)]
#[template(path = "digest.html")]
struct DigestTemplate {
    categories: Vec<CategoryGroup>,
}

struct CategoryGroup {
    name: String,
    products: Vec<DigestProduct>,
}

struct DigestProduct {
    name: String,
    brand: Option<String>,
    points: u64,
    description: Option<String>,
    link: String,
    image_url: Option<String>,
}

/// A digest ready for delivery.
#[derive(Debug, Clone)]
pub struct RenderedDigest {
    pub min_points: u64,
    pub product_count: usize,
    pub html: String,
}

impl RenderedDigest {
    pub fn subject(&self) -> String {
        format!("New reward products above {} points", self.min_points)
    }
}

/// Renders per-threshold HTML digests of new products.
#[derive(Debug, Clone)]
pub struct DigestRenderer {
    image_base: String,
}

impl Default for DigestRenderer {
    fn default() -> Self {
        Self::new(DEFAULT_IMAGE_BASE)
    }
}

impl DigestRenderer {
    pub fn new(image_base: impl Into<String>) -> Self {
        Self {
            image_base: image_base.into(),
        }
    }

    /// Filter `new_products` to notifiable records costing at least
    /// `min_points`, group them by category and render the digest.
    /// Returns `None` when nothing qualifies; that is the "nothing to
    /// send" signal, not an error.
    pub fn render(
        &self,
        new_products: &[RewardProduct],
        min_points: u64,
    ) -> anyhow::Result<Option<RenderedDigest>> {
        let qualifying = notifiable_above(new_products, min_points);
        if qualifying.is_empty() {
            return Ok(None);
        }
        let product_count = qualifying.len();

        let categories = group_by_category(qualifying)
            .into_iter()
            .map(|(name, products)| CategoryGroup {
                name,
                products: products
                    .into_iter()
                    .map(|p| self.digest_product(p))
                    .collect(),
            })
            .collect();

        let html = DigestTemplate { categories }.render()?;
        Ok(Some(RenderedDigest {
            min_points,
            product_count,
            html,
        }))
    }

    fn digest_product(&self, product: &RewardProduct) -> DigestProduct {
        DigestProduct {
            name: product.display_name().to_string(),
            brand: product.brand_name.clone(),
            points: product.reward_points,
            description: product.description().map(str::to_string),
            link: product
                .full_size_product_url
                .clone()
                .unwrap_or_else(|| "#".to_string()),
            image_url: product
                .image
                .as_deref()
                .map(|path| format!("{}{}", self.image_base, path)),
        }
    }
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("delivery request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("delivery rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Delivers one rendered digest to one recipient. Fan-out across
/// recipients and thresholds lives in the orchestrator, which isolates
/// per-recipient failures.
#[async_trait]
pub trait DigestSender: Send + Sync {
    async fn send(&self, recipient: &str, subject: &str, html_body: &str) -> Result<(), SendError>;
}

#[derive(Debug, Clone, Serialize)]
struct EmailRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
}

/// Sends digests through a Resend-style JSON email API.
#[derive(Debug)]
pub struct HttpApiSender {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    sender: String,
}

impl HttpApiSender {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        sender: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
            api_key: api_key.into(),
            sender: sender.into(),
        }
    }
}

#[async_trait]
impl DigestSender for HttpApiSender {
    async fn send(&self, recipient: &str, subject: &str, html_body: &str) -> Result<(), SendError> {
        let request = EmailRequest {
            from: &self.sender,
            to: [recipient],
            subject,
            html: html_body,
        };
        let resp = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SendError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        info!(recipient, subject, "digest delivered");
        Ok(())
    }
}

/// Logs instead of delivering. Used when no email API is configured.
#[derive(Debug, Default)]
pub struct NoopSender;

#[async_trait]
impl DigestSender for NoopSender {
    async fn send(&self, recipient: &str, subject: &str, _html_body: &str) -> Result<(), SendError> {
        info!(recipient, subject, "email delivery disabled; digest dropped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcw_core::{RewardsInfo, NO_TRIGGER_SUB_TYPE};

    fn product(id: &str, points: u64) -> RewardProduct {
        RewardProduct {
            product_id: id.to_string(),
            product_name: Some(format!("Product {id}")),
            reward_points: points,
            ..RewardProduct::default()
        }
    }

    #[test]
    fn render_with_zero_threshold_includes_every_notifiable_product() {
        let renderer = DigestRenderer::default();
        let products = vec![product("1", 0), product("2", 750)];
        let digest = renderer.render(&products, 0).expect("render").expect("digest");
        assert_eq!(digest.product_count, 2);
        assert!(digest.html.contains("Product 1"));
        assert!(digest.html.contains("Product 2"));
        assert!(digest.html.contains("Points: 750"));
    }

    #[test]
    fn render_above_every_product_returns_no_content() {
        let renderer = DigestRenderer::default();
        let products = vec![product("1", 100), product("2", 200)];
        assert!(renderer.render(&products, 500).expect("render").is_none());
    }

    #[test]
    fn threshold_splits_audiences_from_one_diff() {
        // Scenario C: one 100-point product, thresholds 200 and 50.
        let renderer = DigestRenderer::default();
        let products = vec![product("2", 100)];
        assert!(renderer.render(&products, 200).expect("render").is_none());
        let digest = renderer.render(&products, 50).expect("render").expect("digest");
        assert!(digest.html.contains("Product 2"));
    }

    #[test]
    fn no_trigger_products_never_render() {
        let renderer = DigestRenderer::default();
        let mut hidden = product("h", 9000);
        hidden.reward_sub_type = Some(NO_TRIGGER_SUB_TYPE.to_string());
        assert!(renderer.render(&[hidden], 0).expect("render").is_none());
    }

    #[test]
    fn digest_groups_by_category_and_prefixes_image_urls() {
        let renderer = DigestRenderer::new("https://retailer.example");
        let mut makeup = product("1", 250);
        makeup.bi_type = Some("Makeup".to_string());
        makeup.image = Some("/productimages/p1.jpg".to_string());
        makeup.full_size_product_url = Some("https://retailer.example/p/1".to_string());
        makeup.brand_name = Some("BrandCo".to_string());
        makeup.rewards_info = Some(RewardsInfo {
            description: Some("A tiny lipstick".to_string()),
        });
        let uncategorized = product("2", 300);

        let digest = renderer
            .render(&[makeup, uncategorized], 0)
            .expect("render")
            .expect("digest");
        assert!(digest.html.contains("<h2 class=\"category-title\">Makeup</h2>"));
        assert!(digest.html.contains("<h2 class=\"category-title\">Other</h2>"));
        assert!(digest
            .html
            .contains("https://retailer.example/productimages/p1.jpg"));
        assert!(digest.html.contains("BrandCo"));
        assert!(digest.html.contains("A tiny lipstick"));
    }

    #[test]
    fn missing_optional_fields_fall_back_to_placeholders() {
        let renderer = DigestRenderer::default();
        let bare = RewardProduct {
            product_id: "BARE".to_string(),
            reward_points: 50,
            ..RewardProduct::default()
        };
        let digest = renderer.render(&[bare], 0).expect("render").expect("digest");
        // Nameless records show their id and link to the placeholder.
        assert!(digest.html.contains("BARE"));
        assert!(digest.html.contains("href=\"#\""));
        assert!(!digest.html.contains("<img"));
    }

    #[tokio::test]
    async fn noop_sender_accepts_every_delivery() {
        let sender = NoopSender;
        sender
            .send("a@example.com", "New reward products above 0 points", "<html></html>")
            .await
            .expect("noop delivery always succeeds");
    }

    #[test]
    fn subject_names_the_threshold() {
        let digest = RenderedDigest {
            min_points: 600,
            product_count: 1,
            html: String::new(),
        };
        assert_eq!(digest.subject(), "New reward products above 600 points");
    }
}
