//! Pricing collaborator.
//!
//! Prices are credits per `unit` tokens. Costs are returned in micro-credits
//! (1/1000 credit) and rounded up to whole credits by [`credits_from_micro`].

use async_trait::async_trait;
use std::sync::RwLock;

use crate::core::error::Result;
use crate::store::models::Pricing;

#[async_trait]
pub trait PricingService: Send + Sync {
    /// Cost of a call in micro-credits, or `None` when no active price applies.
    async fn calculate_cost(
        &self,
        model: &str,
        upstream_id: Option<&str>,
        input_tokens: i64,
        output_tokens: i64,
        is_estimate: bool,
    ) -> Result<Option<i64>>;
}

/// Round micro-credits up to whole credits.
pub fn credits_from_micro(micro: i64) -> i64 {
    (micro + 999) / 1000
}

#[derive(Default)]
pub struct InMemoryPricing {
    rows: RwLock<Vec<Pricing>>,
}

impl InMemoryPricing {
    pub fn new(rows: Vec<Pricing>) -> Self {
        Self {
            rows: RwLock::new(rows),
        }
    }

    pub fn insert(&self, row: Pricing) {
        self.rows
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(row);
    }

    /// Upstream-specific row first, then the model-wide one.
    fn lookup(&self, model: &str, upstream_id: Option<&str>) -> Option<Pricing> {
        let rows = self.rows.read().unwrap_or_else(|e| e.into_inner());
        let active = || rows.iter().filter(|p| p.is_active && p.model == model);

        upstream_id
            .and_then(|id| active().find(|p| p.upstream_id.as_deref() == Some(id)))
            .or_else(|| active().find(|p| p.upstream_id.is_none()))
            .cloned()
    }
}

#[async_trait]
impl PricingService for InMemoryPricing {
    async fn calculate_cost(
        &self,
        model: &str,
        upstream_id: Option<&str>,
        input_tokens: i64,
        output_tokens: i64,
        is_estimate: bool,
    ) -> Result<Option<i64>> {
        let Some(price) = self.lookup(model, upstream_id) else {
            return Ok(None);
        };

        let unit = if price.unit > 0 { price.unit } else { 1000 } as f64;
        let total = input_tokens as f64 / unit * price.input_price
            + output_tokens as f64 / unit * price.output_price;
        let micro = (total * 1000.0).round() as i64;

        tracing::debug!(
            model = %model,
            is_estimate = is_estimate,
            micro_credits = micro,
            "Calculated cost"
        );
        Ok(Some(micro))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn price(model: &str, upstream_id: Option<&str>, input: f64, output: f64) -> Pricing {
        Pricing {
            model: model.to_string(),
            upstream_id: upstream_id.map(str::to_string),
            input_price: input,
            output_price: output,
            unit: 1000,
            is_active: true,
        }
    }

    #[test]
    fn test_credits_round_up() {
        assert_eq!(credits_from_micro(0), 0);
        assert_eq!(credits_from_micro(1), 1);
        assert_eq!(credits_from_micro(1000), 1);
        assert_eq!(credits_from_micro(1001), 2);
    }

    #[tokio::test]
    async fn test_cost_per_unit() {
        let pricing = InMemoryPricing::new(vec![price("gpt-4", None, 3.0, 6.0)]);

        // 1000 in at 3/1k + 500 out at 6/1k = 6 credits = 6000 micro.
        let micro = pricing
            .calculate_cost("gpt-4", None, 1000, 500, false)
            .await
            .unwrap();
        assert_eq!(micro, Some(6000));
    }

    #[tokio::test]
    async fn test_upstream_specific_row_wins() {
        let pricing = InMemoryPricing::new(vec![
            price("gpt-4", None, 1.0, 1.0),
            price("gpt-4", Some("cheap"), 0.5, 0.5),
        ]);

        let specific = pricing
            .calculate_cost("gpt-4", Some("cheap"), 1000, 1000, false)
            .await
            .unwrap();
        let general = pricing
            .calculate_cost("gpt-4", Some("other"), 1000, 1000, false)
            .await
            .unwrap();
        assert_eq!(specific, Some(1000));
        assert_eq!(general, Some(2000));
    }

    #[tokio::test]
    async fn test_missing_or_inactive_price() {
        let mut inactive = price("claude", None, 1.0, 1.0);
        inactive.is_active = false;
        let pricing = InMemoryPricing::new(vec![inactive]);

        assert_eq!(
            pricing
                .calculate_cost("claude", None, 10, 10, true)
                .await
                .unwrap(),
            None
        );
        assert_eq!(
            pricing
                .calculate_cost("unknown", None, 10, 10, true)
                .await
                .unwrap(),
            None
        );
    }
}
