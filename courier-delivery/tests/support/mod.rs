#![allow(dead_code)]

pub mod mock_server;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use courier_delivery::{DnsConfig, DnsError, MxAnswer, MxLookup, MxRecord, MxResolver};

/// MX answers from a fixed table. Unknown domains do not exist.
#[derive(Debug, Default)]
pub struct StaticMx {
    answers: HashMap<String, MxAnswer>,
}

impl StaticMx {
    #[must_use]
    pub fn with(mut self, domain: &str, records: Vec<MxRecord>) -> Self {
        self.answers
            .insert(domain.to_string(), MxAnswer::Records { records, ttl: 300 });
        self
    }

    #[must_use]
    pub fn resolver(self) -> Arc<MxResolver> {
        let config = DnsConfig {
            shuffle_equal_priority: false,
            ..DnsConfig::default()
        };
        Arc::new(MxResolver::new(Arc::new(self), config))
    }
}

#[async_trait]
impl MxLookup for StaticMx {
    async fn lookup_mx(&self, domain: &str) -> Result<MxAnswer, DnsError> {
        self.answers
            .get(domain)
            .cloned()
            .ok_or_else(|| DnsError::DomainNotFound {
                domain: domain.to_string(),
                record_type: "MX",
                reason: "NXDOMAIN".to_string(),
            })
    }
}

/// An MX record pointing at a local port.
#[must_use]
pub fn local_mx(priority: u16, port: u16) -> MxRecord {
    MxRecord::new(priority, "127.0.0.1", port)
}

pub const MESSAGE: &[u8] = b"From: Alice <alice@example.org>\r\n\
To: bob@example.com\r\n\
Subject: Test\r\n\
\r\n\
Hello Bob.\r\n";
