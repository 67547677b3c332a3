use crate::dbprovider::DbError;
use crate::transfer_meta::{
    BoxEntity, BoxSendMethod, IncomingImageEntity, IncomingTransactionEntity, OutgoingImageEntity,
    OutgoingTagValueEntity, OutgoingTransactionEntity, OutgoingTransactionImage, TransactionStatus,
};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};

pub async fn create_tables(pool: &SqlitePool) -> Result<(), DbError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS boxes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            token TEXT NOT NULL,
            base_url TEXT NOT NULL,
            send_method TEXT NOT NULL,
            online INTEGER NOT NULL DEFAULT 0,
            last_contact INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(DbError::from_sqlx)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS outgoing_transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            box_id INTEGER NOT NULL,
            box_name TEXT NOT NULL,
            sent_image_count INTEGER NOT NULL DEFAULT 0,
            total_image_count INTEGER NOT NULL,
            created INTEGER NOT NULL,
            updated INTEGER NOT NULL,
            status TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(DbError::from_sqlx)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS outgoing_images (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            outgoing_transaction_id INTEGER NOT NULL
                REFERENCES outgoing_transactions(id) ON DELETE CASCADE,
            image_id INTEGER NOT NULL,
            sequence_number INTEGER NOT NULL,
            sent INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(DbError::from_sqlx)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS outgoing_tag_values (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            outgoing_image_id INTEGER NOT NULL
                REFERENCES outgoing_images(id) ON DELETE CASCADE,
            tag INTEGER NOT NULL,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(DbError::from_sqlx)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS incoming_transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            box_id INTEGER NOT NULL,
            box_name TEXT NOT NULL,
            outgoing_transaction_id INTEGER NOT NULL,
            received_image_count INTEGER NOT NULL DEFAULT 0,
            added_image_count INTEGER NOT NULL DEFAULT 0,
            total_image_count INTEGER NOT NULL,
            created INTEGER NOT NULL,
            updated INTEGER NOT NULL,
            status TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(DbError::from_sqlx)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS incoming_images (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            incoming_transaction_id INTEGER NOT NULL
                REFERENCES incoming_transactions(id) ON DELETE CASCADE,
            sequence_number INTEGER NOT NULL,
            image_id INTEGER NOT NULL,
            overwrite INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(DbError::from_sqlx)?;

    let indexes = [
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_unique_box_name ON boxes(name)",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_unique_outgoing_image \
         ON outgoing_images(outgoing_transaction_id, sequence_number)",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_unique_incoming_transaction \
         ON incoming_transactions(box_id, outgoing_transaction_id)",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_unique_incoming_image \
         ON incoming_images(incoming_transaction_id, sequence_number)",
    ];
    for index_sql in indexes {
        sqlx::query(index_sql)
            .execute(pool)
            .await
            .map_err(DbError::from_sqlx)?;
    }

    Ok(())
}

fn transaction_image_from_row(row: &SqliteRow) -> Result<OutgoingTransactionImage, DbError> {
    let status: String = row.get("status");
    let status = status
        .parse::<TransactionStatus>()
        .map_err(DbError::DatabaseError)?;
    Ok(OutgoingTransactionImage {
        transaction: OutgoingTransactionEntity {
            id: row.get("t_id"),
            box_id: row.get("box_id"),
            box_name: row.get("box_name"),
            sent_image_count: row.get("sent_image_count"),
            total_image_count: row.get("total_image_count"),
            created: row.get("created"),
            updated: row.get("updated"),
            status,
        },
        image: OutgoingImageEntity {
            id: row.get("i_id"),
            outgoing_transaction_id: row.get("outgoing_transaction_id"),
            image_id: row.get("image_id"),
            sequence_number: row.get("sequence_number"),
            sent: row.get("sent"),
        },
    })
}

const TRANSACTION_IMAGE_COLUMNS: &str = "t.id AS t_id, t.box_id, t.box_name, \
     t.sent_image_count, t.total_image_count, t.created, t.updated, t.status, \
     i.id AS i_id, i.outgoing_transaction_id, i.image_id, i.sequence_number, i.sent";

/// 传输表的持久化操作. 所有跨行不变式的更新都在单个数据库事务内执行.
#[derive(Debug, Clone)]
pub struct TransferStore {
    pool: SqlitePool,
}

impl TransferStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ========== 节点 ==========

    pub async fn insert_box(
        &self,
        name: &str,
        token: &str,
        base_url: &str,
        send_method: BoxSendMethod,
    ) -> Result<BoxEntity, DbError> {
        let result = sqlx::query(
            r#"
            INSERT INTO boxes (name, token, base_url, send_method, online, last_contact)
            VALUES (?, ?, ?, ?, 0, 0)
            "#,
        )
        .bind(name)
        .bind(token)
        .bind(base_url)
        .bind(send_method.to_string())
        .execute(&self.pool)
        .await
        .map_err(DbError::from_sqlx)?;

        self.box_by_id(result.last_insert_rowid())
            .await?
            .ok_or_else(|| DbError::NotFound(format!("box {}", name)))
    }

    pub async fn box_by_id(&self, box_id: i64) -> Result<Option<BoxEntity>, DbError> {
        sqlx::query_as::<_, BoxEntity>("SELECT * FROM boxes WHERE id = ?")
            .bind(box_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from_sqlx)
    }

    /// 推送接收端的令牌认证, 不限传输方式
    pub async fn box_by_token(&self, token: &str) -> Result<Option<BoxEntity>, DbError> {
        sqlx::query_as::<_, BoxEntity>("SELECT * FROM boxes WHERE token = ?")
            .bind(token)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from_sqlx)
    }

    /// 轮询端点的令牌认证, 只接受 POLL 节点
    pub async fn poll_box_by_token(&self, token: &str) -> Result<Option<BoxEntity>, DbError> {
        sqlx::query_as::<_, BoxEntity>(
            "SELECT * FROM boxes WHERE token = ? AND send_method = 'POLL'",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from_sqlx)
    }

    pub async fn list_boxes(&self) -> Result<Vec<BoxEntity>, DbError> {
        sqlx::query_as::<_, BoxEntity>("SELECT * FROM boxes ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from_sqlx)
    }

    pub async fn update_box_online(
        &self,
        box_id: i64,
        online: bool,
        now: i64,
    ) -> Result<(), DbError> {
        sqlx::query("UPDATE boxes SET online = ?, last_contact = ? WHERE id = ?")
            .bind(online)
            .bind(now)
            .bind(box_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::from_sqlx)?;
        Ok(())
    }

    /// 删除节点并级联删除其发出的传输. 节点不拥有传输行, 所以显式删除.
    pub async fn delete_box(&self, box_id: i64) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await.map_err(DbError::from_sqlx)?;

        sqlx::query("DELETE FROM outgoing_transactions WHERE box_id = ?")
            .bind(box_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::from_sqlx)?;

        sqlx::query("DELETE FROM boxes WHERE id = ?")
            .bind(box_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::from_sqlx)?;

        tx.commit().await.map_err(DbError::from_sqlx)?;
        Ok(())
    }

    // ========== 发送队列 ==========

    /// 建立一次传输: 事务行 + 按 1 起始的连续序号的影像行 + 每张影像的强制属性
    pub async fn insert_outgoing_transaction_with_images(
        &self,
        box_id: i64,
        box_name: &str,
        entries: &[(i64, Vec<(i64, String)>)],
        now: i64,
    ) -> Result<OutgoingTransactionEntity, DbError> {
        let mut tx = self.pool.begin().await.map_err(DbError::from_sqlx)?;

        let result = sqlx::query(
            r#"
            INSERT INTO outgoing_transactions
                (box_id, box_name, sent_image_count, total_image_count, created, updated, status)
            VALUES (?, ?, 0, ?, ?, ?, ?)
            "#,
        )
        .bind(box_id)
        .bind(box_name)
        .bind(entries.len() as i64)
        .bind(now)
        .bind(now)
        .bind(TransactionStatus::Waiting.to_string())
        .execute(&mut *tx)
        .await
        .map_err(DbError::from_sqlx)?;
        let transaction_id = result.last_insert_rowid();

        for (index, (image_id, tag_values)) in entries.iter().enumerate() {
            let image_result = sqlx::query(
                r#"
                INSERT INTO outgoing_images
                    (outgoing_transaction_id, image_id, sequence_number, sent)
                VALUES (?, ?, ?, 0)
                "#,
            )
            .bind(transaction_id)
            .bind(image_id)
            .bind(index as i64 + 1)
            .execute(&mut *tx)
            .await
            .map_err(DbError::from_sqlx)?;
            let outgoing_image_id = image_result.last_insert_rowid();

            for (tag, value) in tag_values {
                sqlx::query(
                    "INSERT INTO outgoing_tag_values (outgoing_image_id, tag, value) VALUES (?, ?, ?)",
                )
                .bind(outgoing_image_id)
                .bind(tag)
                .bind(value)
                .execute(&mut *tx)
                .await
                .map_err(DbError::from_sqlx)?;
            }
        }

        tx.commit().await.map_err(DbError::from_sqlx)?;

        self.outgoing_transaction_by_id(transaction_id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("outgoing transaction {}", transaction_id)))
    }

    pub async fn outgoing_transaction_by_id(
        &self,
        transaction_id: i64,
    ) -> Result<Option<OutgoingTransactionEntity>, DbError> {
        sqlx::query_as::<_, OutgoingTransactionEntity>(
            "SELECT * FROM outgoing_transactions WHERE id = ?",
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from_sqlx)
    }

    /// 该节点最老的未发送影像, 排除 FAILED/FINISHED 的传输,
    /// 先按传输的 created 再按影像序号排序
    pub async fn next_outgoing_transaction_image(
        &self,
        box_id: i64,
    ) -> Result<Option<OutgoingTransactionImage>, DbError> {
        let sql = format!(
            r#"
            SELECT {TRANSACTION_IMAGE_COLUMNS}
            FROM outgoing_transactions t
            JOIN outgoing_images i ON i.outgoing_transaction_id = t.id
            WHERE t.box_id = ?
              AND t.status NOT IN ('FAILED', 'FINISHED')
              AND i.sent = 0
            ORDER BY t.created ASC, i.sequence_number ASC
            LIMIT 1
            "#
        );
        let row = sqlx::query(&sql)
            .bind(box_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from_sqlx)?;
        row.map(|r| transaction_image_from_row(&r)).transpose()
    }

    /// 轮询协议里按 (事务, 影像行) 取回指定工作单元
    pub async fn outgoing_transaction_image(
        &self,
        box_id: i64,
        transaction_id: i64,
        outgoing_image_id: i64,
    ) -> Result<Option<OutgoingTransactionImage>, DbError> {
        let sql = format!(
            r#"
            SELECT {TRANSACTION_IMAGE_COLUMNS}
            FROM outgoing_transactions t
            JOIN outgoing_images i ON i.outgoing_transaction_id = t.id
            WHERE t.box_id = ? AND t.id = ? AND i.id = ?
            "#
        );
        let row = sqlx::query(&sql)
            .bind(box_id)
            .bind(transaction_id)
            .bind(outgoing_image_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from_sqlx)?;
        row.map(|r| transaction_image_from_row(&r)).transpose()
    }

    pub async fn tag_values_for_outgoing_image(
        &self,
        outgoing_image_id: i64,
    ) -> Result<Vec<OutgoingTagValueEntity>, DbError> {
        sqlx::query_as::<_, OutgoingTagValueEntity>(
            "SELECT * FROM outgoing_tag_values WHERE outgoing_image_id = ? ORDER BY id",
        )
        .bind(outgoing_image_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from_sqlx)
    }

    /// 确认单张影像送达. 重复确认不会重复计数; 发送计数从影像行重新统计,
    /// 计数与状态翻转在同一事务内提交, 不会出现 "全部已发送但状态未完成".
    /// FAILED/FINISHED 是终态, 迟到或重放的确认不会把传输拉回来.
    pub async fn mark_outgoing_image_sent(
        &self,
        transaction_id: i64,
        outgoing_image_id: i64,
        now: i64,
    ) -> Result<OutgoingTransactionEntity, DbError> {
        let mut tx = self.pool.begin().await.map_err(DbError::from_sqlx)?;

        sqlx::query("UPDATE outgoing_images SET sent = 1 WHERE id = ? AND sent = 0")
            .bind(outgoing_image_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::from_sqlx)?;

        let sent_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM outgoing_images WHERE outgoing_transaction_id = ? AND sent = 1",
        )
        .bind(transaction_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(DbError::from_sqlx)?;

        let total: i64 = sqlx::query_scalar(
            "SELECT total_image_count FROM outgoing_transactions WHERE id = ?",
        )
        .bind(transaction_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(DbError::from_sqlx)?;

        let status = if sent_count == total {
            TransactionStatus::Finished
        } else {
            TransactionStatus::Processing
        };

        sqlx::query(
            "UPDATE outgoing_transactions SET sent_image_count = ?, updated = ?, status = ? \
             WHERE id = ? AND status NOT IN ('FAILED', 'FINISHED')",
        )
        .bind(sent_count)
        .bind(now)
        .bind(status.to_string())
        .bind(transaction_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::from_sqlx)?;

        tx.commit().await.map_err(DbError::from_sqlx)?;

        self.outgoing_transaction_by_id(transaction_id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("outgoing transaction {}", transaction_id)))
    }

    /// 终态之外的状态翻转. FAILED/FINISHED 的传输不再改动.
    pub async fn set_outgoing_transaction_status(
        &self,
        transaction_id: i64,
        status: TransactionStatus,
        now: i64,
    ) -> Result<(), DbError> {
        sqlx::query(
            "UPDATE outgoing_transactions SET status = ?, updated = ? \
             WHERE id = ? AND status NOT IN ('FAILED', 'FINISHED')",
        )
        .bind(status.to_string())
        .bind(now)
        .bind(transaction_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::from_sqlx)?;
        Ok(())
    }

    pub async fn list_outgoing_transactions(
        &self,
        limit: i64,
    ) -> Result<Vec<OutgoingTransactionEntity>, DbError> {
        sqlx::query_as::<_, OutgoingTransactionEntity>(
            "SELECT * FROM outgoing_transactions ORDER BY created DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from_sqlx)
    }

    // ========== 接收记录 ==========

    /// 接收一张影像后的合并更新, 以 (box_id, outgoing_transaction_id) 为键.
    /// 同一 (事务, 序号) 的重放只替换影像指向, 不再推进计数.
    #[allow(clippy::too_many_arguments)]
    pub async fn update_incoming(
        &self,
        box_id: i64,
        box_name: &str,
        outgoing_transaction_id: i64,
        sequence_number: i64,
        total_image_count: i64,
        image_id: i64,
        overwrite: bool,
        now: i64,
    ) -> Result<IncomingTransactionEntity, DbError> {
        let mut tx = self.pool.begin().await.map_err(DbError::from_sqlx)?;

        let existing = sqlx::query_as::<_, IncomingTransactionEntity>(
            "SELECT * FROM incoming_transactions WHERE box_id = ? AND outgoing_transaction_id = ?",
        )
        .bind(box_id)
        .bind(outgoing_transaction_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DbError::from_sqlx)?;

        let (transaction_id, prev_received, prev_added) = match existing {
            Some(t) => (t.id, t.received_image_count, t.added_image_count),
            None => {
                let result = sqlx::query(
                    r#"
                    INSERT INTO incoming_transactions
                        (box_id, box_name, outgoing_transaction_id, received_image_count,
                         added_image_count, total_image_count, created, updated, status)
                    VALUES (?, ?, ?, 0, 0, ?, ?, ?, ?)
                    "#,
                )
                .bind(box_id)
                .bind(box_name)
                .bind(outgoing_transaction_id)
                .bind(total_image_count)
                .bind(now)
                .bind(now)
                .bind(TransactionStatus::Processing.to_string())
                .execute(&mut *tx)
                .await
                .map_err(DbError::from_sqlx)?;
                (result.last_insert_rowid(), 0, 0)
            }
        };

        let existing_image = sqlx::query_as::<_, IncomingImageEntity>(
            "SELECT * FROM incoming_images WHERE incoming_transaction_id = ? AND sequence_number = ?",
        )
        .bind(transaction_id)
        .bind(sequence_number)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DbError::from_sqlx)?;

        let (received, added) = match existing_image {
            Some(image) => {
                sqlx::query("UPDATE incoming_images SET image_id = ?, overwrite = ? WHERE id = ?")
                    .bind(image_id)
                    .bind(overwrite)
                    .bind(image.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(DbError::from_sqlx)?;
                (prev_received, prev_added)
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO incoming_images
                        (incoming_transaction_id, sequence_number, image_id, overwrite)
                    VALUES (?, ?, ?, ?)
                    "#,
                )
                .bind(transaction_id)
                .bind(sequence_number)
                .bind(image_id)
                .bind(overwrite)
                .execute(&mut *tx)
                .await
                .map_err(DbError::from_sqlx)?;

                let received = (prev_received + 1).min(total_image_count);
                let added = if overwrite {
                    prev_added
                } else {
                    (prev_added + 1).min(total_image_count)
                };
                (received, added)
            }
        };

        let status = if received == total_image_count {
            TransactionStatus::Finished
        } else {
            TransactionStatus::Processing
        };

        sqlx::query(
            r#"
            UPDATE incoming_transactions
            SET received_image_count = ?, added_image_count = ?, total_image_count = ?,
                updated = ?, status = ?
            WHERE id = ?
            "#,
        )
        .bind(received)
        .bind(added)
        .bind(total_image_count)
        .bind(now)
        .bind(status.to_string())
        .bind(transaction_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::from_sqlx)?;

        tx.commit().await.map_err(DbError::from_sqlx)?;

        self.incoming_transaction_by_id(transaction_id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("incoming transaction {}", transaction_id)))
    }

    pub async fn incoming_transaction_by_id(
        &self,
        transaction_id: i64,
    ) -> Result<Option<IncomingTransactionEntity>, DbError> {
        sqlx::query_as::<_, IncomingTransactionEntity>(
            "SELECT * FROM incoming_transactions WHERE id = ?",
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from_sqlx)
    }

    pub async fn incoming_transaction_by_key(
        &self,
        box_id: i64,
        outgoing_transaction_id: i64,
    ) -> Result<Option<IncomingTransactionEntity>, DbError> {
        sqlx::query_as::<_, IncomingTransactionEntity>(
            "SELECT * FROM incoming_transactions WHERE box_id = ? AND outgoing_transaction_id = ?",
        )
        .bind(box_id)
        .bind(outgoing_transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from_sqlx)
    }

    pub async fn incoming_images_for_transaction(
        &self,
        transaction_id: i64,
    ) -> Result<Vec<IncomingImageEntity>, DbError> {
        sqlx::query_as::<_, IncomingImageEntity>(
            "SELECT * FROM incoming_images WHERE incoming_transaction_id = ? ORDER BY sequence_number",
        )
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from_sqlx)
    }

    pub async fn list_incoming_transactions(
        &self,
        limit: i64,
    ) -> Result<Vec<IncomingTransactionEntity>, DbError> {
        sqlx::query_as::<_, IncomingTransactionEntity>(
            "SELECT * FROM incoming_transactions ORDER BY created DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from_sqlx)
    }

    // ========== 监督任务 ==========

    /// 周期性状态刷新: POLL 节点的在线标志按最近一次轮询时间衰减,
    /// PUSH 节点的在线标志只归推送结果管, 这里不碰;
    /// 停滞的 PROCESSING 传输退回 WAITING. FINISHED/FAILED 不受影响.
    pub async fn update_status_for_boxes_and_transactions(
        &self,
        now: i64,
        timeout_millis: i64,
    ) -> Result<(), DbError> {
        let threshold = now - timeout_millis;

        sqlx::query(
            "UPDATE boxes SET online = CASE WHEN last_contact > ? THEN 1 ELSE 0 END \
             WHERE send_method = 'POLL'",
        )
        .bind(threshold)
        .execute(&self.pool)
        .await
        .map_err(DbError::from_sqlx)?;

        sqlx::query(
            "UPDATE outgoing_transactions SET status = 'WAITING' \
             WHERE status = 'PROCESSING' AND updated < ?",
        )
        .bind(threshold)
        .execute(&self.pool)
        .await
        .map_err(DbError::from_sqlx)?;

        sqlx::query(
            "UPDATE incoming_transactions SET status = 'WAITING' \
             WHERE status = 'PROCESSING' AND updated < ?",
        )
        .bind(threshold)
        .execute(&self.pool)
        .await
        .map_err(DbError::from_sqlx)?;

        Ok(())
    }

    /// 影像被删除后清掉两侧的引用行
    pub async fn remove_image_references(&self, image_ids: &[i64]) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await.map_err(DbError::from_sqlx)?;
        for image_id in image_ids {
            sqlx::query("DELETE FROM outgoing_images WHERE image_id = ?")
                .bind(image_id)
                .execute(&mut *tx)
                .await
                .map_err(DbError::from_sqlx)?;
            sqlx::query("DELETE FROM incoming_images WHERE image_id = ?")
                .bind(image_id)
                .execute(&mut *tx)
                .await
                .map_err(DbError::from_sqlx)?;
        }
        tx.commit().await.map_err(DbError::from_sqlx)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbprovider::test_pool;

    async fn test_store() -> TransferStore {
        TransferStore::new(test_pool().await)
    }

    async fn push_box(store: &TransferStore, name: &str) -> BoxEntity {
        store
            .insert_box(name, &format!("token-{}", name), "http://remote/api", BoxSendMethod::Push)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_insert_box_duplicate_name_conflicts() {
        let store = test_store().await;
        push_box(&store, "remote-a").await;
        let result = store
            .insert_box("remote-a", "other-token", "http://other/api", BoxSendMethod::Poll)
            .await;
        assert!(matches!(result, Err(DbError::AlreadyExists)));
    }

    #[tokio::test]
    async fn test_poll_box_by_token_filters_method() {
        let store = test_store().await;
        push_box(&store, "pusher").await;
        store
            .insert_box("poller", "poll-token", "http://poller/api", BoxSendMethod::Poll)
            .await
            .unwrap();

        assert!(store.poll_box_by_token("token-pusher").await.unwrap().is_none());
        let found = store.poll_box_by_token("poll-token").await.unwrap().unwrap();
        assert_eq!(found.name, "poller");

        // 推送认证对两种方式都放行
        assert!(store.box_by_token("token-pusher").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_next_outgoing_orders_by_created_then_sequence() {
        let store = test_store().await;
        let remote = push_box(&store, "remote-b").await;

        let first = store
            .insert_outgoing_transaction_with_images(
                remote.id,
                &remote.name,
                &[(10, vec![]), (11, vec![])],
                1000,
            )
            .await
            .unwrap();
        let second = store
            .insert_outgoing_transaction_with_images(remote.id, &remote.name, &[(20, vec![])], 2000)
            .await
            .unwrap();

        let next = store.next_outgoing_transaction_image(remote.id).await.unwrap().unwrap();
        assert_eq!(next.transaction.id, first.id);
        assert_eq!(next.image.sequence_number, 1);
        assert_eq!(next.image.image_id, 10);

        store
            .mark_outgoing_image_sent(first.id, next.image.id, 1500)
            .await
            .unwrap();

        let next = store.next_outgoing_transaction_image(remote.id).await.unwrap().unwrap();
        assert_eq!(next.transaction.id, first.id);
        assert_eq!(next.image.sequence_number, 2);

        store
            .mark_outgoing_image_sent(first.id, next.image.id, 1600)
            .await
            .unwrap();

        // 第一笔完成后才轮到第二笔
        let next = store.next_outgoing_transaction_image(remote.id).await.unwrap().unwrap();
        assert_eq!(next.transaction.id, second.id);
    }

    #[tokio::test]
    async fn test_mark_sent_flips_status_at_completion() {
        let store = test_store().await;
        let remote = push_box(&store, "remote-c").await;
        let transaction = store
            .insert_outgoing_transaction_with_images(
                remote.id,
                &remote.name,
                &[(1, vec![]), (2, vec![])],
                100,
            )
            .await
            .unwrap();

        let first = store.next_outgoing_transaction_image(remote.id).await.unwrap().unwrap();
        let updated = store
            .mark_outgoing_image_sent(transaction.id, first.image.id, 200)
            .await
            .unwrap();
        assert_eq!(updated.sent_image_count, 1);
        assert_eq!(updated.status, TransactionStatus::Processing);

        let second = store.next_outgoing_transaction_image(remote.id).await.unwrap().unwrap();
        let updated = store
            .mark_outgoing_image_sent(transaction.id, second.image.id, 300)
            .await
            .unwrap();
        assert_eq!(updated.sent_image_count, 2);
        assert_eq!(updated.status, TransactionStatus::Finished);
    }

    #[tokio::test]
    async fn test_duplicate_ack_counts_once() {
        let store = test_store().await;
        let remote = push_box(&store, "remote-d").await;
        let transaction = store
            .insert_outgoing_transaction_with_images(
                remote.id,
                &remote.name,
                &[(1, vec![]), (2, vec![])],
                100,
            )
            .await
            .unwrap();

        let work = store.next_outgoing_transaction_image(remote.id).await.unwrap().unwrap();
        store
            .mark_outgoing_image_sent(transaction.id, work.image.id, 200)
            .await
            .unwrap();
        let updated = store
            .mark_outgoing_image_sent(transaction.id, work.image.id, 300)
            .await
            .unwrap();

        assert_eq!(updated.sent_image_count, 1);
        assert_eq!(updated.status, TransactionStatus::Processing);
    }

    #[tokio::test]
    async fn test_tag_values_follow_their_image() {
        let store = test_store().await;
        let remote = push_box(&store, "remote-e").await;
        let transaction = store
            .insert_outgoing_transaction_with_images(
                remote.id,
                &remote.name,
                &[(5, vec![(0x00100010, "OVERRIDE^NAME".to_string())]), (6, vec![])],
                100,
            )
            .await
            .unwrap();

        let work = store.next_outgoing_transaction_image(remote.id).await.unwrap().unwrap();
        assert_eq!(work.transaction.id, transaction.id);
        let tag_values = store.tag_values_for_outgoing_image(work.image.id).await.unwrap();
        assert_eq!(tag_values.len(), 1);
        assert_eq!(tag_values[0].tag, 0x00100010);
        assert_eq!(tag_values[0].value, "OVERRIDE^NAME");
    }

    #[tokio::test]
    async fn test_update_incoming_upserts_and_finishes() {
        let store = test_store().await;
        let sender = push_box(&store, "sender-a").await;

        let t = store
            .update_incoming(sender.id, &sender.name, 77, 1, 2, 501, false, 1000)
            .await
            .unwrap();
        assert_eq!(t.received_image_count, 1);
        assert_eq!(t.added_image_count, 1);
        assert_eq!(t.status, TransactionStatus::Processing);

        let t = store
            .update_incoming(sender.id, &sender.name, 77, 2, 2, 502, false, 1100)
            .await
            .unwrap();
        assert_eq!(t.received_image_count, 2);
        assert_eq!(t.added_image_count, 2);
        assert_eq!(t.status, TransactionStatus::Finished);
    }

    #[tokio::test]
    async fn test_update_incoming_replay_is_idempotent() {
        let store = test_store().await;
        let sender = push_box(&store, "sender-b").await;

        let first = store
            .update_incoming(sender.id, &sender.name, 88, 1, 2, 600, false, 1000)
            .await
            .unwrap();
        let replay = store
            .update_incoming(sender.id, &sender.name, 88, 1, 2, 600, true, 1200)
            .await
            .unwrap();

        assert_eq!(replay.received_image_count, first.received_image_count);
        assert_eq!(replay.added_image_count, first.added_image_count);

        let images = store.incoming_images_for_transaction(replay.id).await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].image_id, 600);
    }

    #[tokio::test]
    async fn test_update_incoming_overwrite_skips_added_count() {
        let store = test_store().await;
        let sender = push_box(&store, "sender-c").await;

        let t = store
            .update_incoming(sender.id, &sender.name, 99, 1, 3, 700, true, 1000)
            .await
            .unwrap();
        assert_eq!(t.received_image_count, 1);
        assert_eq!(t.added_image_count, 0);
        assert!(t.added_image_count <= t.received_image_count);
        assert!(t.received_image_count <= t.total_image_count);
    }

    #[tokio::test]
    async fn test_status_refresh_demotes_stalled_only() {
        let store = test_store().await;
        let remote = push_box(&store, "remote-f").await;

        let stalled = store
            .insert_outgoing_transaction_with_images(remote.id, &remote.name, &[(1, vec![])], 100)
            .await
            .unwrap();
        store
            .set_outgoing_transaction_status(stalled.id, TransactionStatus::Processing, 100)
            .await
            .unwrap();

        let finished = store
            .insert_outgoing_transaction_with_images(remote.id, &remote.name, &[(2, vec![])], 100)
            .await
            .unwrap();
        let finished_images = sqlx::query_as::<_, OutgoingImageEntity>(
            "SELECT * FROM outgoing_images WHERE outgoing_transaction_id = ?",
        )
        .bind(finished.id)
        .fetch_all(store.pool())
        .await
        .unwrap();
        store
            .mark_outgoing_image_sent(finished.id, finished_images[0].id, 150)
            .await
            .unwrap();

        // now=100_000, timeout=10_000: updated=100/150 的都算停滞
        store
            .update_status_for_boxes_and_transactions(100_000, 10_000)
            .await
            .unwrap();

        let stalled = store.outgoing_transaction_by_id(stalled.id).await.unwrap().unwrap();
        assert_eq!(stalled.status, TransactionStatus::Waiting);

        // 已完成的传输不会被退回
        let finished = store.outgoing_transaction_by_id(finished.id).await.unwrap().unwrap();
        assert_eq!(finished.status, TransactionStatus::Finished);
    }

    #[tokio::test]
    async fn test_status_refresh_updates_poll_box_online() {
        let store = test_store().await;
        let poller = store
            .insert_box("poller-g", "poll-g", "", BoxSendMethod::Poll)
            .await
            .unwrap();
        store.update_box_online(poller.id, true, 95_000).await.unwrap();

        store
            .update_status_for_boxes_and_transactions(100_000, 10_000)
            .await
            .unwrap();
        assert!(store.box_by_id(poller.id).await.unwrap().unwrap().online);

        store
            .update_status_for_boxes_and_transactions(200_000, 10_000)
            .await
            .unwrap();
        assert!(!store.box_by_id(poller.id).await.unwrap().unwrap().online);
    }

    #[tokio::test]
    async fn test_status_refresh_leaves_push_box_online_alone() {
        let store = test_store().await;
        let remote = push_box(&store, "remote-g").await;
        // 推送失败: 离线, 但 last_contact 记的是这次尝试的时间
        store.update_box_online(remote.id, false, 95_000).await.unwrap();

        store
            .update_status_for_boxes_and_transactions(100_000, 10_000)
            .await
            .unwrap();

        // PUSH 节点的在线标志只认推送结果, 周期刷新不会翻回来
        assert!(!store.box_by_id(remote.id).await.unwrap().unwrap().online);
    }

    #[tokio::test]
    async fn test_failed_transaction_ignores_late_ack() {
        let store = test_store().await;
        let remote = push_box(&store, "remote-i").await;
        let transaction = store
            .insert_outgoing_transaction_with_images(
                remote.id,
                &remote.name,
                &[(1, vec![]), (2, vec![])],
                100,
            )
            .await
            .unwrap();

        let first = store.next_outgoing_transaction_image(remote.id).await.unwrap().unwrap();
        store
            .mark_outgoing_image_sent(transaction.id, first.image.id, 200)
            .await
            .unwrap();
        store
            .set_outgoing_transaction_status(transaction.id, TransactionStatus::Failed, 300)
            .await
            .unwrap();

        // 第一张的确认重放迟到, 不能把 FAILED 拉回 PROCESSING
        let after = store
            .mark_outgoing_image_sent(transaction.id, first.image.id, 400)
            .await
            .unwrap();
        assert_eq!(after.status, TransactionStatus::Failed);
        assert_eq!(after.sent_image_count, 1);

        // 终态同样挡住显式的状态翻转
        store
            .set_outgoing_transaction_status(transaction.id, TransactionStatus::Waiting, 500)
            .await
            .unwrap();
        let unchanged = store.outgoing_transaction_by_id(transaction.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, TransactionStatus::Failed);
    }

    #[tokio::test]
    async fn test_delete_box_cascades_transactions() {
        let store = test_store().await;
        let remote = push_box(&store, "remote-h").await;
        let transaction = store
            .insert_outgoing_transaction_with_images(
                remote.id,
                &remote.name,
                &[(1, vec![(0x00100010, "X".to_string())])],
                100,
            )
            .await
            .unwrap();

        store.delete_box(remote.id).await.unwrap();

        assert!(store.box_by_id(remote.id).await.unwrap().is_none());
        assert!(store.outgoing_transaction_by_id(transaction.id).await.unwrap().is_none());

        let image_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outgoing_images")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(image_count, 0);
        let tag_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outgoing_tag_values")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(tag_count, 0);
    }

    #[tokio::test]
    async fn test_unique_incoming_image_index() {
        let store = test_store().await;
        let sender = push_box(&store, "sender-d").await;
        let t = store
            .update_incoming(sender.id, &sender.name, 5, 1, 2, 300, false, 1000)
            .await
            .unwrap();

        let result = sqlx::query(
            "INSERT INTO incoming_images (incoming_transaction_id, sequence_number, image_id, overwrite) \
             VALUES (?, 1, 999, 0)",
        )
        .bind(t.id)
        .execute(store.pool())
        .await;
        assert!(matches!(
            result.map_err(DbError::from_sqlx),
            Err(DbError::AlreadyExists)
        ));
    }
}
