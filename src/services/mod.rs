use serde::Deserialize;

pub mod audit_service;
pub mod auth_service;
pub mod inventory_service;

fn default_limit() -> i64 {
    100
}

/// Offset/limit query parameters shared by the listing endpoints.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

impl Pagination {
    /// Returns (skip, limit) with skip floored at 0 and limit clamped to 1..=1000.
    pub fn clamp(self) -> (i64, i64) {
        (self.skip.max(0), self.limit.clamp(1, 1000))
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            skip: 0,
            limit: default_limit(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_defaults() {
        let (skip, limit) = Pagination::default().clamp();
        assert_eq!(skip, 0);
        assert_eq!(limit, 100);
    }

    #[test]
    fn test_pagination_clamps_out_of_range_values() {
        let (skip, limit) = Pagination { skip: -5, limit: 0 }.clamp();
        assert_eq!(skip, 0);
        assert_eq!(limit, 1);

        let (_, limit) = Pagination {
            skip: 10,
            limit: 5000,
        }
        .clamp();
        assert_eq!(limit, 1000);
    }
}
