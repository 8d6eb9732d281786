//! Product catalog: product lookup and per-account-type hourly rates.

use config::{Config as Cfg, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use service_core::error::AppError;
use std::collections::HashMap;

use crate::models::{AccountType, Product, ProductRate};

#[derive(Debug, Deserialize)]
struct CatalogFile {
    products: Vec<Product>,
}

#[derive(Debug, Clone)]
pub struct ProductCatalog {
    products: HashMap<String, Product>,
}

impl ProductCatalog {
    pub fn new(products: Vec<Product>) -> Self {
        Self {
            products: products.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }

    /// Load from a YAML/TOML/JSON file with a top-level `products` list.
    pub fn from_file(path: &str) -> Result<Self, AppError> {
        let file: CatalogFile = Cfg::builder()
            .add_source(File::with_name(path))
            .build()?
            .try_deserialize()?;

        if file.products.is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Product catalog at {} has no products",
                path
            )));
        }

        tracing::info!(path = %path, products = file.products.len(), "Product catalog loaded");
        Ok(Self::new(file.products))
    }

    /// Catalog used when no file is configured.
    pub fn builtin() -> Self {
        let all = |rate: Decimal| -> Vec<ProductRate> {
            AccountType::ALL
                .iter()
                .map(|t| ProductRate {
                    account_type: *t,
                    hourly_rate: rate,
                })
                .collect()
        };

        Self::new(vec![
            Product {
                id: "vm-spr-sml".to_string(),
                name: "Small VM - Sapphire Rapids".to_string(),
                product_type: "compute-vm".to_string(),
                paid: true,
                rates: all(Decimal::new(360, 2)),
                min_granularity_secs: 60,
            },
            Product {
                id: "vm-spr-med".to_string(),
                name: "Medium VM - Sapphire Rapids".to_string(),
                product_type: "compute-vm".to_string(),
                paid: true,
                rates: all(Decimal::new(720, 2)),
                min_granularity_secs: 60,
            },
            Product {
                id: "bm-spr".to_string(),
                name: "Bare Metal - Sapphire Rapids".to_string(),
                product_type: "compute-bm".to_string(),
                paid: true,
                rates: vec![
                    ProductRate {
                        account_type: AccountType::Premium,
                        hourly_rate: Decimal::new(1800, 2),
                    },
                    ProductRate {
                        account_type: AccountType::Enterprise,
                        hourly_rate: Decimal::new(1500, 2),
                    },
                ],
                min_granularity_secs: 60,
            },
            Product {
                id: "vm-free-tiny".to_string(),
                name: "Tiny VM - Free Tier".to_string(),
                product_type: "compute-vm".to_string(),
                paid: false,
                rates: all(Decimal::ZERO),
                min_granularity_secs: 1,
            },
        ])
    }

    pub fn find(&self, product_id: &str) -> Option<&Product> {
        self.products.get(product_id)
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn builtin_catalog_prices_by_account_type() {
        let catalog = ProductCatalog::builtin();
        let bm = catalog.find("bm-spr").unwrap();

        assert_eq!(bm.rate_for(AccountType::Premium), Some(Decimal::new(18, 0)));
        assert_eq!(bm.rate_for(AccountType::Standard), None);
        assert!(!catalog.find("vm-free-tiny").unwrap().paid);
        assert!(catalog.find("gpu-h100").is_none());
    }

    #[test]
    fn loads_catalog_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            r#"
products:
  - id: gpu-max
    name: GPU Max
    product_type: compute-gpu
    paid: true
    min_granularity_secs: 30
    rates:
      - account_type: standard
        hourly_rate: "10.5"
      - account_type: premium
        hourly_rate: "9"
"#
        )
        .unwrap();

        let catalog = ProductCatalog::from_file(file.path().to_str().unwrap()).unwrap();
        let gpu = catalog.find("gpu-max").unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(gpu.min_granularity_secs, 30);
        assert_eq!(gpu.rate_for(AccountType::Standard), Some(Decimal::new(105, 1)));
        assert_eq!(gpu.rate_for(AccountType::Enterprise), None);
    }

    #[test]
    fn missing_catalog_file_is_a_config_error() {
        let err = ProductCatalog::from_file("/nonexistent/catalog.yaml").unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }
}
