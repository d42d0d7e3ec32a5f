//! Every DML string the core issues, rendered once per configured table
//! prefix and cached for the lifetime of the storage handle. The prefix is a
//! configuration boundary, not user input; values always go through binds.

/// Expiring tables swept by the expiration manager, in sweep order.
pub(crate) const EXPIRING_TABLES: &[&str] = &["AggregatedCounter", "Job", "List", "Set", "Hash"];

#[derive(Debug)]
pub(crate) struct Statements {
    pub prefix: String,
    pub jobs: JobSql,
    pub states: StateSql,
    pub queue: QueueSql,
    pub servers: ServerSql,
    pub counters: CounterSql,
    pub sets: SetSql,
    pub lists: ListSql,
    pub hashes: HashSql,
    /// One `DELETE … LIMIT ?` per entry of [`EXPIRING_TABLES`], same order.
    pub expire: Vec<String>,
}

#[derive(Debug)]
pub(crate) struct JobSql {
    pub insert: String,
    pub get_data: String,
    pub expire: String,
    pub persist: String,
    pub set_parameter: String,
    pub get_parameter: String,
    pub insert_parameter: String,
}

#[derive(Debug)]
pub(crate) struct StateSql {
    pub insert: String,
    pub point_job_at_last_state: String,
    pub get_for_job: String,
}

#[derive(Debug)]
pub(crate) struct QueueSql {
    pub enqueue: String,
    /// Two halves of the claim statement; the queue-name placeholder list
    /// between them depends on how many queues one dequeue call watches.
    pub claim_prefix: String,
    pub claim_suffix: String,
    pub fetch_by_token: String,
    pub remove: String,
    pub requeue: String,
}

impl QueueSql {
    pub fn claim(&self, queue_count: usize) -> String {
        let mut marks = "?,".repeat(queue_count);
        marks.pop();
        format!("{}{}{}", self.claim_prefix, marks, self.claim_suffix)
    }
}

#[derive(Debug)]
pub(crate) struct ServerSql {
    pub announce: String,
    pub heartbeat: String,
    pub remove: String,
    pub remove_timed_out: String,
}

#[derive(Debug)]
pub(crate) struct CounterSql {
    pub insert: String,
    pub get: String,
    pub create_refs: String,
    pub roll_up: String,
    pub delete_rolled_up: String,
    pub drop_refs: String,
}

#[derive(Debug)]
pub(crate) struct SetSql {
    pub add: String,
    pub remove: String,
    pub get_range: String,
    pub get_all: String,
    pub first_by_lowest_score: String,
    pub count: String,
    pub expire: String,
    pub persist: String,
    pub ttl: String,
}

#[derive(Debug)]
pub(crate) struct ListSql {
    pub insert: String,
    pub remove: String,
    pub trim: String,
    pub get_range: String,
    pub get_all: String,
    pub count: String,
    pub expire: String,
    pub persist: String,
    pub ttl: String,
}

#[derive(Debug)]
pub(crate) struct HashSql {
    pub set_field: String,
    pub remove: String,
    pub get_all: String,
    pub count: String,
    pub expire: String,
    pub persist: String,
    pub ttl: String,
}

impl Statements {
    pub fn new(prefix: &str) -> Self {
        let t = |name: &str| format!("`{prefix}{name}`");

        let job = t("Job");
        let job_parameter = t("JobParameter");
        let job_queue = t("JobQueue");
        let state = t("State");
        let server = t("Server");
        let counter = t("Counter");
        let aggregated = t("AggregatedCounter");
        let set = t("Set");
        let list = t("List");
        let hash = t("Hash");
        let counter_refs = format!("`__{prefix}CounterRefs`");

        let jobs = JobSql {
            insert: format!(
                "INSERT INTO {job} (`InvocationData`, `Arguments`, `CreatedAt`, `ExpireAt`) \
                 VALUES (?, ?, ?, ?)"
            ),
            get_data: format!(
                "SELECT `InvocationData`, `Arguments`, `StateName`, `CreatedAt` \
                 FROM {job} WHERE `Id` = ?"
            ),
            expire: format!("UPDATE {job} SET `ExpireAt` = ? WHERE `Id` = ?"),
            persist: format!("UPDATE {job} SET `ExpireAt` = NULL WHERE `Id` = ?"),
            set_parameter: format!(
                "INSERT INTO {job_parameter} (`JobId`, `Name`, `Value`) VALUES (?, ?, ?) \
                 ON DUPLICATE KEY UPDATE `Value` = VALUES(`Value`)"
            ),
            get_parameter: format!(
                "SELECT `Value` FROM {job_parameter} WHERE `JobId` = ? AND `Name` = ?"
            ),
            insert_parameter: format!(
                "INSERT INTO {job_parameter} (`JobId`, `Name`, `Value`) VALUES (?, ?, ?)"
            ),
        };

        let states = StateSql {
            insert: format!(
                "INSERT INTO {state} (`JobId`, `Name`, `Reason`, `CreatedAt`, `Data`) \
                 VALUES (?, ?, ?, ?, ?)"
            ),
            // Must run on the same connection, inside the same transaction,
            // as the insert above: LAST_INSERT_ID() is session state.
            point_job_at_last_state: format!(
                "UPDATE {job} SET `StateId` = LAST_INSERT_ID(), `StateName` = ? WHERE `Id` = ?"
            ),
            get_for_job: format!(
                "SELECT s.`Name`, s.`Reason`, s.`Data` \
                 FROM {job} j JOIN {state} s ON s.`Id` = j.`StateId` \
                 WHERE j.`Id` = ?"
            ),
        };

        let queue = QueueSql {
            enqueue: format!("INSERT INTO {job_queue} (`JobId`, `Queue`) VALUES (?, ?)"),
            claim_prefix: format!(
                "UPDATE {job_queue} SET `FetchedAt` = ?, `FetchToken` = ? WHERE `Queue` IN ("
            ),
            claim_suffix: ") AND (`FetchedAt` IS NULL OR `FetchedAt` < ?) LIMIT 1".to_string(),
            fetch_by_token: format!(
                "SELECT `Id`, `JobId`, `Queue` FROM {job_queue} WHERE `FetchToken` = ? LIMIT 1"
            ),
            remove: format!("DELETE FROM {job_queue} WHERE `Id` = ?"),
            requeue: format!("UPDATE {job_queue} SET `FetchedAt` = NULL WHERE `Id` = ?"),
        };

        let servers = ServerSql {
            announce: format!(
                "INSERT INTO {server} (`Id`, `Data`, `LastHeartbeat`) VALUES (?, ?, ?) \
                 ON DUPLICATE KEY UPDATE `Data` = VALUES(`Data`), \
                 `LastHeartbeat` = VALUES(`LastHeartbeat`)"
            ),
            heartbeat: format!("UPDATE {server} SET `LastHeartbeat` = ? WHERE `Id` = ?"),
            remove: format!("DELETE FROM {server} WHERE `Id` = ?"),
            remove_timed_out: format!("DELETE FROM {server} WHERE `LastHeartbeat` < ?"),
        };

        let counters = CounterSql {
            insert: format!(
                "INSERT INTO {counter} (`Key`, `Value`, `ExpireAt`) VALUES (?, ?, ?)"
            ),
            // Public counter reads must see raw and rolled-up rows as one
            // number, so aggregation stays invisible to readers.
            get: format!(
                "SELECT CAST(COALESCE(SUM(`Value`), 0) AS SIGNED) FROM ( \
                 SELECT `Value` FROM {counter} WHERE `Key` = ? \
                 UNION ALL \
                 SELECT `Value` FROM {aggregated} WHERE `Key` = ?) AS `totals`"
            ),
            create_refs: format!(
                "CREATE TEMPORARY TABLE {counter_refs} ENGINE=MEMORY \
                 AS SELECT `Id` FROM {counter} LIMIT {{count}}"
            ),
            roll_up: format!(
                "INSERT INTO {aggregated} (`Key`, `Value`, `ExpireAt`) \
                 SELECT c.`Key`, SUM(c.`Value`), MAX(c.`ExpireAt`) \
                 FROM {counter} c JOIN {counter_refs} r ON r.`Id` = c.`Id` \
                 GROUP BY c.`Key` \
                 ON DUPLICATE KEY UPDATE \
                 `Value` = `Value` + VALUES(`Value`), \
                 `ExpireAt` = GREATEST(`ExpireAt`, VALUES(`ExpireAt`))"
            ),
            delete_rolled_up: format!(
                "DELETE c FROM {counter} c JOIN {counter_refs} r ON r.`Id` = c.`Id`"
            ),
            drop_refs: format!("DROP TEMPORARY TABLE IF EXISTS {counter_refs}"),
        };

        let sets = SetSql {
            add: format!(
                "INSERT INTO {set} (`Key`, `Value`, `Score`) VALUES (?, ?, ?) \
                 ON DUPLICATE KEY UPDATE `Score` = VALUES(`Score`)"
            ),
            remove: format!("DELETE FROM {set} WHERE `Key` = ? AND `Value` = ?"),
            get_range: format!(
                "SELECT `Value` FROM {set} WHERE `Key` = ? ORDER BY `Id` ASC LIMIT ?, ?"
            ),
            get_all: format!("SELECT `Value` FROM {set} WHERE `Key` = ? ORDER BY `Id` ASC"),
            first_by_lowest_score: format!(
                "SELECT `Value` FROM {set} WHERE `Key` = ? AND `Score` BETWEEN ? AND ? \
                 ORDER BY `Score` ASC LIMIT 1"
            ),
            count: format!("SELECT COUNT(*) FROM {set} WHERE `Key` = ?"),
            expire: format!("UPDATE {set} SET `ExpireAt` = ? WHERE `Key` = ?"),
            persist: format!("UPDATE {set} SET `ExpireAt` = NULL WHERE `Key` = ?"),
            ttl: format!("SELECT MIN(`ExpireAt`) FROM {set} WHERE `Key` = ?"),
        };

        let lists = ListSql {
            insert: format!("INSERT INTO {list} (`Key`, `Value`) VALUES (?, ?)"),
            remove: format!("DELETE FROM {list} WHERE `Key` = ? AND `Value` = ?"),
            // Rank rows 1..N by Id ascending within the key; keep the
            // requested rank window, delete the rest.
            trim: format!(
                "DELETE FROM {list} WHERE `Key` = ? AND `Id` NOT IN ( \
                 SELECT `Id` FROM ( \
                 SELECT `Id` FROM {list} WHERE `Key` = ? ORDER BY `Id` ASC LIMIT ?, ?) AS `keep`)"
            ),
            get_range: format!(
                "SELECT `Value` FROM {list} WHERE `Key` = ? ORDER BY `Id` DESC LIMIT ?, ?"
            ),
            get_all: format!("SELECT `Value` FROM {list} WHERE `Key` = ? ORDER BY `Id` DESC"),
            count: format!("SELECT COUNT(*) FROM {list} WHERE `Key` = ?"),
            expire: format!("UPDATE {list} SET `ExpireAt` = ? WHERE `Key` = ?"),
            persist: format!("UPDATE {list} SET `ExpireAt` = NULL WHERE `Key` = ?"),
            ttl: format!("SELECT MIN(`ExpireAt`) FROM {list} WHERE `Key` = ?"),
        };

        let hashes = HashSql {
            set_field: format!(
                "INSERT INTO {hash} (`Key`, `Field`, `Value`) VALUES (?, ?, ?) \
                 ON DUPLICATE KEY UPDATE `Value` = VALUES(`Value`)"
            ),
            remove: format!("DELETE FROM {hash} WHERE `Key` = ?"),
            get_all: format!("SELECT `Field`, `Value` FROM {hash} WHERE `Key` = ?"),
            count: format!("SELECT COUNT(*) FROM {hash} WHERE `Key` = ?"),
            expire: format!("UPDATE {hash} SET `ExpireAt` = ? WHERE `Key` = ?"),
            persist: format!("UPDATE {hash} SET `ExpireAt` = NULL WHERE `Key` = ?"),
            ttl: format!("SELECT MIN(`ExpireAt`) FROM {hash} WHERE `Key` = ?"),
        };

        let expire = EXPIRING_TABLES
            .iter()
            .map(|table| format!("DELETE FROM {} WHERE `ExpireAt` < ? LIMIT ?", t(table)))
            .collect();

        Self {
            prefix: prefix.to_string(),
            jobs,
            states,
            queue,
            servers,
            counters,
            sets,
            lists,
            hashes,
            expire,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_reaches_every_table() {
        let sql = Statements::new("hf_");
        assert!(sql.jobs.insert.contains("`hf_Job`"));
        assert!(sql.queue.enqueue.contains("`hf_JobQueue`"));
        assert!(sql.states.insert.contains("`hf_State`"));
        assert!(sql.servers.announce.contains("`hf_Server`"));
        assert!(sql.counters.get.contains("`hf_Counter`"));
        assert!(sql.counters.get.contains("`hf_AggregatedCounter`"));
        assert!(sql.sets.add.contains("`hf_Set`"));
        assert!(sql.lists.insert.contains("`hf_List`"));
        assert!(sql.hashes.set_field.contains("`hf_Hash`"));
        for stmt in &sql.expire {
            assert!(stmt.contains("`hf_"));
        }
    }

    #[test]
    fn aggregation_statements_use_the_configured_prefix_uniformly() {
        // Regression guard: every table reference in the roll-up pipeline
        // must come from the prefix, including the temp table.
        let sql = Statements::new("lib2_");
        for stmt in [
            &sql.counters.create_refs,
            &sql.counters.roll_up,
            &sql.counters.delete_rolled_up,
            &sql.counters.drop_refs,
        ] {
            assert!(!stmt.contains("lib1_"), "stale prefix in {stmt}");
            assert!(stmt.contains("lib2_"), "missing prefix in {stmt}");
        }
    }

    #[test]
    fn claim_renders_one_placeholder_per_queue() {
        let sql = Statements::new("");
        let claim = sql.queue.claim(3);
        assert!(claim.contains("IN (?,?,?)"));
        assert!(claim.ends_with("LIMIT 1"));
    }

    #[test]
    fn expire_statements_follow_sweep_order() {
        let sql = Statements::new("p");
        assert_eq!(sql.expire.len(), EXPIRING_TABLES.len());
        assert!(sql.expire[0].contains("`pAggregatedCounter`"));
        assert!(sql.expire[1].contains("`pJob`"));
        assert!(sql.expire[4].contains("`pHash`"));
    }
}
