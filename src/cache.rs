use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::dispatch::models::RobotPosition;

const POSITION_CACHE_TTL: u64 = 300; // 5 minutes

pub struct CacheService;

impl CacheService {
    /// Cache the latest position snapshot for one robot
    pub async fn cache_robot_position(
        redis: &mut ConnectionManager,
        position: &RobotPosition,
    ) -> Result<(), redis::RedisError> {
        let key = format!("fleet:position:{}", position.robot_id);
        let value = serde_json::to_string(position).unwrap_or_default();
        redis.set_ex(key, value, POSITION_CACHE_TTL).await
    }

    /// All cached snapshots; serves the read surface until fresh telemetry
    /// arrives after a restart
    pub async fn get_fleet_positions(
        redis: &mut ConnectionManager,
    ) -> Result<Vec<RobotPosition>, redis::RedisError> {
        let keys: Vec<String> = redis.keys("fleet:position:*").await?;
        let mut positions = Vec::with_capacity(keys.len());
        for key in keys {
            let value: Option<String> = redis.get(key).await?;
            if let Some(position) =
                value.and_then(|v| serde_json::from_str::<RobotPosition>(&v).ok())
            {
                positions.push(position);
            }
        }
        positions.sort_by(|a, b| a.robot_id.cmp(&b.robot_id));
        Ok(positions)
    }
}
