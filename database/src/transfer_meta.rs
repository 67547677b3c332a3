use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use std::fmt::Display;
use std::str::FromStr;

/// 节点间的传输方式. PUSH 表示本节点主动推送, POLL 表示对端拉取
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoxSendMethod {
    Push,
    Poll,
}

impl Display for BoxSendMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BoxSendMethod::Push => write!(f, "PUSH"),
            BoxSendMethod::Poll => write!(f, "POLL"),
        }
    }
}

impl FromStr for BoxSendMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PUSH" => Ok(BoxSendMethod::Push),
            "POLL" => Ok(BoxSendMethod::Poll),
            other => Err(format!("unknown box send method: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Waiting,
    Processing,
    Failed,
    Finished,
}

impl Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionStatus::Waiting => write!(f, "WAITING"),
            TransactionStatus::Processing => write!(f, "PROCESSING"),
            TransactionStatus::Failed => write!(f, "FAILED"),
            TransactionStatus::Finished => write!(f, "FINISHED"),
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WAITING" => Ok(TransactionStatus::Waiting),
            "PROCESSING" => Ok(TransactionStatus::Processing),
            "FAILED" => Ok(TransactionStatus::Failed),
            "FINISHED" => Ok(TransactionStatus::Finished),
            other => Err(format!("unknown transaction status: {}", other)),
        }
    }
}

fn decode_column<T: FromStr<Err = String>>(row: &SqliteRow, column: &str) -> Result<T, sqlx::Error> {
    let raw: String = row.get(column);
    raw.parse::<T>().map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: e.into(),
    })
}

/// 对端节点
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoxEntity {
    #[serde(rename = "id")]
    pub id: i64,
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "token")]
    pub token: String,
    #[serde(rename = "base_url")]
    pub base_url: String,
    #[serde(rename = "send_method")]
    pub send_method: BoxSendMethod,
    #[serde(rename = "online")]
    pub online: bool,
    #[serde(rename = "last_contact")]
    pub last_contact: i64,
}

impl sqlx::FromRow<'_, SqliteRow> for BoxEntity {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(BoxEntity {
            id: row.get("id"),
            name: row.get("name"),
            token: row.get("token"),
            base_url: row.get("base_url"),
            send_method: decode_column(row, "send_method")?,
            online: row.get("online"),
            last_contact: row.get("last_contact"),
        })
    }
}

/// 一次 "发送N张影像到对端" 的逻辑传输
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingTransactionEntity {
    #[serde(rename = "id")]
    pub id: i64,
    #[serde(rename = "box_id")]
    pub box_id: i64,
    #[serde(rename = "box_name")]
    pub box_name: String,
    #[serde(rename = "sent_image_count")]
    pub sent_image_count: i64,
    #[serde(rename = "total_image_count")]
    pub total_image_count: i64,
    #[serde(rename = "created")]
    pub created: i64,
    #[serde(rename = "updated")]
    pub updated: i64,
    #[serde(rename = "status")]
    pub status: TransactionStatus,
}

impl sqlx::FromRow<'_, SqliteRow> for OutgoingTransactionEntity {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(OutgoingTransactionEntity {
            id: row.get("id"),
            box_id: row.get("box_id"),
            box_name: row.get("box_name"),
            sent_image_count: row.get("sent_image_count"),
            total_image_count: row.get("total_image_count"),
            created: row.get("created"),
            updated: row.get("updated"),
            status: decode_column(row, "status")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingImageEntity {
    #[serde(rename = "id")]
    pub id: i64,
    #[serde(rename = "outgoing_transaction_id")]
    pub outgoing_transaction_id: i64,
    #[serde(rename = "image_id")]
    pub image_id: i64,
    #[serde(rename = "sequence_number")]
    pub sequence_number: i64,
    #[serde(rename = "sent")]
    pub sent: bool,
}

impl sqlx::FromRow<'_, SqliteRow> for OutgoingImageEntity {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(OutgoingImageEntity {
            id: row.get("id"),
            outgoing_transaction_id: row.get("outgoing_transaction_id"),
            image_id: row.get("image_id"),
            sequence_number: row.get("sequence_number"),
            sent: row.get("sent"),
        })
    }
}

/// 发送单张影像时强制覆盖的DICOM属性
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingTagValueEntity {
    #[serde(rename = "id")]
    pub id: i64,
    #[serde(rename = "outgoing_image_id")]
    pub outgoing_image_id: i64,
    #[serde(rename = "tag")]
    pub tag: i64,
    #[serde(rename = "value")]
    pub value: String,
}

impl sqlx::FromRow<'_, SqliteRow> for OutgoingTagValueEntity {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(OutgoingTagValueEntity {
            id: row.get("id"),
            outgoing_image_id: row.get("outgoing_image_id"),
            tag: row.get("tag"),
            value: row.get("value"),
        })
    }
}

/// 轮询协议的工作单元, 也是 /outgoing/poll 的应答体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingTransactionImage {
    #[serde(rename = "transaction")]
    pub transaction: OutgoingTransactionEntity,
    #[serde(rename = "image")]
    pub image: OutgoingImageEntity,
}

/// 接收端镜像的传输记录, 以 (box_id, outgoing_transaction_id) 为键
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingTransactionEntity {
    #[serde(rename = "id")]
    pub id: i64,
    #[serde(rename = "box_id")]
    pub box_id: i64,
    #[serde(rename = "box_name")]
    pub box_name: String,
    #[serde(rename = "outgoing_transaction_id")]
    pub outgoing_transaction_id: i64,
    #[serde(rename = "received_image_count")]
    pub received_image_count: i64,
    #[serde(rename = "added_image_count")]
    pub added_image_count: i64,
    #[serde(rename = "total_image_count")]
    pub total_image_count: i64,
    #[serde(rename = "created")]
    pub created: i64,
    #[serde(rename = "updated")]
    pub updated: i64,
    #[serde(rename = "status")]
    pub status: TransactionStatus,
}

impl sqlx::FromRow<'_, SqliteRow> for IncomingTransactionEntity {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(IncomingTransactionEntity {
            id: row.get("id"),
            box_id: row.get("box_id"),
            box_name: row.get("box_name"),
            outgoing_transaction_id: row.get("outgoing_transaction_id"),
            received_image_count: row.get("received_image_count"),
            added_image_count: row.get("added_image_count"),
            total_image_count: row.get("total_image_count"),
            created: row.get("created"),
            updated: row.get("updated"),
            status: decode_column(row, "status")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingImageEntity {
    #[serde(rename = "id")]
    pub id: i64,
    #[serde(rename = "incoming_transaction_id")]
    pub incoming_transaction_id: i64,
    #[serde(rename = "sequence_number")]
    pub sequence_number: i64,
    #[serde(rename = "image_id")]
    pub image_id: i64,
    #[serde(rename = "overwrite")]
    pub overwrite: bool,
}

impl sqlx::FromRow<'_, SqliteRow> for IncomingImageEntity {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(IncomingImageEntity {
            id: row.get("id"),
            incoming_transaction_id: row.get("incoming_transaction_id"),
            sequence_number: row.get("sequence_number"),
            image_id: row.get("image_id"),
            overwrite: row.get("overwrite"),
        })
    }
}

/// 轮询端回报传输失败的请求体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedOutgoingTransaction {
    #[serde(rename = "transaction_id")]
    pub transaction_id: i64,
    #[serde(rename = "message")]
    pub message: String,
}
