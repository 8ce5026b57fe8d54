//! Summary printed once storage has been closed.

use std::fmt;
use std::time::Duration;

use crate::storage::{Records, Transaction};
use crate::tracker::ConnectionId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub id: ConnectionId,
    pub requests: usize,
    pub responses: usize,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub closed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Report {
    pub connections: Vec<ConnectionSummary>,
    pub transactions: Vec<Transaction>,
    pub unanswered: usize,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl Report {
    pub fn from_records(records: &Records) -> Self {
        let connections: Vec<ConnectionSummary> = records
            .connections()
            .iter()
            .map(|(&id, record)| ConnectionSummary {
                id,
                requests: record.requests.len(),
                responses: record.responses.len(),
                bytes_in: record.incoming_bytes,
                bytes_out: record.outgoing_bytes,
                closed: record.closed.is_some(),
            })
            .collect();

        let transactions = records.transactions();
        let unanswered = transactions.iter().filter(|t| t.response.is_none()).count();

        Report {
            bytes_in: connections.iter().map(|c| c.bytes_in).sum(),
            bytes_out: connections.iter().map(|c| c.bytes_out).sum(),
            connections,
            transactions,
            unanswered,
        }
    }

    /// Mean request-to-response time over answered transactions.
    pub fn mean_latency(&self) -> Option<Duration> {
        let latencies: Vec<Duration> = self.transactions.iter().filter_map(|t| t.latency).collect();
        if latencies.is_empty() {
            return None;
        }
        let total: Duration = latencies.iter().sum();
        Some(total / latencies.len() as u32)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<16}  {:>8}  {:>9}  {:>12}  {:>12}  {}",
            "connection", "requests", "responses", "bytes in", "bytes out", "state"
        )?;
        for c in &self.connections {
            writeln!(
                f,
                "{:<16}  {:>8}  {:>9}  {:>12}  {:>12}  {}",
                c.id.to_string(),
                c.requests,
                c.responses,
                c.bytes_in,
                c.bytes_out,
                if c.closed { "closed" } else { "open" }
            )?;
        }

        writeln!(f)?;
        writeln!(f, "connections:  {}", self.connections.len())?;
        writeln!(f, "transactions: {}", self.transactions.len())?;
        writeln!(f, "unanswered:   {}", self.unanswered)?;
        writeln!(f, "bytes in:     {}", self.bytes_in)?;
        writeln!(f, "bytes out:    {}", self.bytes_out)?;
        match self.mean_latency() {
            Some(latency) => writeln!(f, "mean latency: {latency:?}"),
            None => writeln!(f, "mean latency: -"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::storage::{RequestSummary, ResponseSummary, StorageEvent};

    fn request(target: &str) -> RequestSummary {
        RequestSummary {
            method: "GET".to_string(),
            target: target.to_string(),
            host: None,
            body_bytes: 0,
        }
    }

    #[test]
    fn counts_unanswered_requests_and_bytes() {
        let id = ConnectionId(1);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(10);
        let mut records = Records::default();
        records.apply(StorageEvent::RequestSent {
            connection: id,
            seq: 0,
            at: t0,
            request: request("/a"),
        });
        records.apply(StorageEvent::RequestSent {
            connection: id,
            seq: 1,
            at: t0,
            request: request("/b"),
        });
        records.apply(StorageEvent::ResponseReceived {
            connection: id,
            seq: 0,
            at: t0 + Duration::from_millis(30),
            request: request("/a"),
            response: ResponseSummary {
                status: 200,
                reason: "OK".to_string(),
                body_bytes: 5,
            },
        });
        records.apply(StorageEvent::IncomingPayload {
            connection: id,
            bytes: 100,
        });
        records.apply(StorageEvent::OutgoingPayload {
            connection: id,
            bytes: 50,
        });

        let report = Report::from_records(&records);
        assert_eq!(report.connections.len(), 1);
        assert_eq!(report.transactions.len(), 2);
        assert_eq!(report.unanswered, 1);
        assert_eq!(report.bytes_in, 100);
        assert_eq!(report.bytes_out, 50);
        assert_eq!(report.mean_latency(), Some(Duration::from_millis(30)));

        let text = report.to_string();
        assert!(text.contains("unanswered:   1"));
        assert!(text.contains(&id.to_string()));
    }
}
