//! Kafka request and response headers.

use byteorder::{BigEndian, ByteOrder};
use serde::Serialize;

/// Length of the fixed part of a request header: api key, api version, correlation id and the
/// client id length.
pub(crate) const REQUEST_HEADER_LEN: usize = 10;
/// Length of a response header.
pub(crate) const RESPONSE_HEADER_LEN: usize = 4;

/// Highest api version accepted for any api key.
const MAX_API_VERSION: i16 = 20;

/// Request names, indexed by api key.
const API_NAMES: [&str; 68] = [
    "Produce",
    "Fetch",
    "ListOffsets",
    "Metadata",
    "LeaderAndIsr",
    "StopReplica",
    "UpdateMetadata",
    "ControlledShutdown",
    "OffsetCommit",
    "OffsetFetch",
    "FindCoordinator",
    "JoinGroup",
    "Heartbeat",
    "LeaveGroup",
    "SyncGroup",
    "DescribeGroups",
    "ListGroups",
    "SaslHandshake",
    "ApiVersions",
    "CreateTopics",
    "DeleteTopics",
    "DeleteRecords",
    "InitProducerId",
    "OffsetForLeaderEpoch",
    "AddPartitionsToTxn",
    "AddOffsetsToTxn",
    "EndTxn",
    "WriteTxnMarkers",
    "TxnOffsetCommit",
    "DescribeAcls",
    "CreateAcls",
    "DeleteAcls",
    "DescribeConfigs",
    "AlterConfigs",
    "AlterReplicaLogDirs",
    "DescribeLogDirs",
    "SaslAuthenticate",
    "CreatePartitions",
    "CreateDelegationToken",
    "RenewDelegationToken",
    "ExpireDelegationToken",
    "DescribeDelegationToken",
    "DeleteGroups",
    "ElectLeaders",
    "IncrementalAlterConfigs",
    "AlterPartitionReassignments",
    "ListPartitionReassignments",
    "OffsetDelete",
    "DescribeClientQuotas",
    "AlterClientQuotas",
    "DescribeUserScramCredentials",
    "AlterUserScramCredentials",
    "Vote",
    "BeginQuorumEpoch",
    "EndQuorumEpoch",
    "DescribeQuorum",
    "AlterPartition",
    "UpdateFeatures",
    "Envelope",
    "FetchSnapshot",
    "DescribeCluster",
    "DescribeProducers",
    "BrokerRegistration",
    "BrokerHeartbeat",
    "UnregisterBroker",
    "DescribeTransactions",
    "ListTransactions",
    "AllocateProducerIds",
];

/// A Kafka request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KafkaRequest {
    /// Frame size, excluding the size field.
    pub size: usize,
    pub api_key: i16,
    pub api_name: String,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: Option<String>,
    /// Leading bytes of the request body, hex encoded.
    pub payload: String,
}

impl KafkaRequest {
    /// Decodes the fixed header. Returns the request and the client id length, `-1` for a null
    /// client id.
    pub(crate) fn parse_header(size: usize, header: &[u8]) -> Result<(Self, i16), String> {
        if header.len() < REQUEST_HEADER_LEN {
            return Err(format!("short request header ({} bytes)", header.len()));
        }
        let api_key = BigEndian::read_i16(&header[0..2]);
        let api_version = BigEndian::read_i16(&header[2..4]);
        let correlation_id = BigEndian::read_i32(&header[4..8]);
        let client_id_len = BigEndian::read_i16(&header[8..10]);

        let api_name = usize::try_from(api_key)
            .ok()
            .and_then(|key| API_NAMES.get(key))
            .ok_or_else(|| format!("unknown api key {}", api_key))?;
        if !(0..=MAX_API_VERSION).contains(&api_version) {
            return Err(format!("unsupported api version {}", api_version));
        }
        if correlation_id < 0 {
            return Err(format!("negative correlation id {}", correlation_id));
        }
        let room = size.saturating_sub(REQUEST_HEADER_LEN) as isize;
        if client_id_len < -1 || client_id_len as isize > room {
            return Err(format!("invalid client id length {}", client_id_len));
        }
        let request = KafkaRequest {
            size,
            api_key,
            api_name: (*api_name).to_owned(),
            api_version,
            correlation_id,
            ..KafkaRequest::default()
        };
        Ok((request, client_id_len))
    }
}

/// A Kafka response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KafkaResponse {
    /// Frame size, excluding the size field.
    pub size: usize,
    pub correlation_id: i32,
    /// Leading bytes of the response body, hex encoded.
    pub payload: String,
}

impl KafkaResponse {
    pub(crate) fn parse_header(size: usize, header: &[u8]) -> Result<Self, String> {
        if header.len() < RESPONSE_HEADER_LEN {
            return Err(format!("short response header ({} bytes)", header.len()));
        }
        let correlation_id = BigEndian::read_i32(&header[0..4]);
        if correlation_id < 0 {
            return Err(format!("negative correlation id {}", correlation_id));
        }
        Ok(KafkaResponse {
            size,
            correlation_id,
            payload: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_header_is_validated() {
        let header = [0, 3, 0, 9, 0, 0, 0, 42, 0, 4];
        let (request, client_id_len) = KafkaRequest::parse_header(30, &header).unwrap();
        assert_eq!(request.api_name, "Metadata");
        assert_eq!(request.api_version, 9);
        assert_eq!(request.correlation_id, 42);
        assert_eq!(client_id_len, 4);

        let unknown_key = [0, 99, 0, 0, 0, 0, 0, 1, 255, 255];
        assert!(KafkaRequest::parse_header(30, &unknown_key).is_err());
        let bad_version = [0, 1, 0, 77, 0, 0, 0, 1, 255, 255];
        assert!(KafkaRequest::parse_header(30, &bad_version).is_err());
        let long_client_id = [0, 1, 0, 1, 0, 0, 0, 1, 0, 40];
        assert!(KafkaRequest::parse_header(30, &long_client_id).is_err());
    }
}
