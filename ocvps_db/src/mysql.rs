use crate::{DhcpLease, SshKey, VpsBastionKey, VpsDb, VpsInstance, VpsTerminalKey};
use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Executor, MySqlPool, Row};

#[derive(Clone)]
pub struct VpsDbMysql {
    db: MySqlPool,
}

impl VpsDbMysql {
    pub async fn new(conn: &str) -> Result<Self> {
        let db = MySqlPool::connect(conn).await?;
        Ok(Self { db })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!().run(&self.db).await?;
        Ok(())
    }

    pub async fn execute(&self, sql: &str) -> Result<()> {
        self.db.execute(sql).await?;
        Ok(())
    }
}

#[async_trait]
impl VpsDb for VpsDbMysql {
    async fn insert_vps(&self, vps: &VpsInstance) -> Result<u64> {
        Ok(sqlx::query(
            "insert into vps_instance(vps_id,organization_id,created_by,display_name,region,node_id,instance_id,cpu_cores,memory_bytes,disk_bytes,image,image_id,size,ssh_key_id,status,ipv4_addresses,ipv6_addresses) values(?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(&vps.vps_id)
        .bind(&vps.organization_id)
        .bind(&vps.created_by)
        .bind(&vps.display_name)
        .bind(&vps.region)
        .bind(&vps.node_id)
        .bind(&vps.instance_id)
        .bind(vps.cpu_cores)
        .bind(vps.memory_bytes)
        .bind(vps.disk_bytes)
        .bind(vps.image)
        .bind(&vps.image_id)
        .bind(&vps.size)
        .bind(vps.ssh_key_id)
        .bind(vps.status)
        .bind(&vps.ipv4_addresses)
        .bind(&vps.ipv6_addresses)
        .execute(&self.db)
        .await?
        .last_insert_id())
    }

    async fn get_vps(&self, vps_id: &str) -> Result<Option<VpsInstance>> {
        Ok(sqlx::query_as("select * from vps_instance where vps_id = ?")
            .bind(vps_id)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn get_vps_by_instance_id(&self, instance_id: &str) -> Result<Option<VpsInstance>> {
        // instance_id uniqueness only holds over non-deleted rows;
        // VMIDs are reused by Proxmox
        Ok(sqlx::query_as(
            "select * from vps_instance where instance_id = ? and status != 9 and deleted_at is null",
        )
        .bind(instance_id)
        .fetch_optional(&self.db)
        .await?)
    }

    async fn list_active_vps(&self) -> Result<Vec<VpsInstance>> {
        Ok(
            sqlx::query_as("select * from vps_instance where status != 9 and deleted_at is null")
                .fetch_all(&self.db)
                .await?,
        )
    }

    async fn update_vps(&self, vps: &VpsInstance) -> Result<()> {
        sqlx::query(
            "update vps_instance set organization_id=?, created_by=?, display_name=?, region=?, node_id=?, instance_id=?, cpu_cores=?, memory_bytes=?, disk_bytes=?, image=?, image_id=?, size=?, ssh_key_id=?, status=?, ipv4_addresses=?, ipv6_addresses=?, updated=current_timestamp, deleted_at=? where vps_id = ?",
        )
        .bind(&vps.organization_id)
        .bind(&vps.created_by)
        .bind(&vps.display_name)
        .bind(&vps.region)
        .bind(&vps.node_id)
        .bind(&vps.instance_id)
        .bind(vps.cpu_cores)
        .bind(vps.memory_bytes)
        .bind(vps.disk_bytes)
        .bind(vps.image)
        .bind(&vps.image_id)
        .bind(&vps.size)
        .bind(vps.ssh_key_id)
        .bind(vps.status)
        .bind(&vps.ipv4_addresses)
        .bind(&vps.ipv6_addresses)
        .bind(vps.deleted_at)
        .bind(&vps.vps_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn upsert_dhcp_lease(&self, lease: &DhcpLease) -> Result<u64> {
        sqlx::query(
            "insert into dhcp_lease(vps_id,organization_id,mac_address,ip_address,is_public,expires_at,gateway_node) values(?,?,?,?,?,?,?) on duplicate key update vps_id=values(vps_id), organization_id=values(organization_id), ip_address=values(ip_address), is_public=values(is_public), expires_at=values(expires_at), gateway_node=values(gateway_node)",
        )
        .bind(&lease.vps_id)
        .bind(&lease.organization_id)
        .bind(&lease.mac_address)
        .bind(&lease.ip_address)
        .bind(lease.is_public)
        .bind(lease.expires_at)
        .bind(&lease.gateway_node)
        .execute(&self.db)
        .await?;

        Ok(sqlx::query("select id from dhcp_lease where mac_address = ?")
            .bind(&lease.mac_address)
            .fetch_one(&self.db)
            .await?
            .try_get(0)?)
    }

    async fn get_private_lease(&self, vps_id: &str) -> Result<Option<DhcpLease>> {
        Ok(
            sqlx::query_as("select * from dhcp_lease where vps_id = ? and is_public = 0")
                .bind(vps_id)
                .fetch_optional(&self.db)
                .await?,
        )
    }

    async fn list_leases(&self, vps_id: &str) -> Result<Vec<DhcpLease>> {
        Ok(sqlx::query_as("select * from dhcp_lease where vps_id = ?")
            .bind(vps_id)
            .fetch_all(&self.db)
            .await?)
    }

    async fn delete_leases(&self, vps_id: &str) -> Result<()> {
        sqlx::query("delete from dhcp_lease where vps_id = ?")
            .bind(vps_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn insert_ssh_key(&self, key: &SshKey) -> Result<u64> {
        Ok(sqlx::query(
            "insert into ssh_key(name,organization_id,vps_id,fingerprint,public_key) values(?,?,?,?,?)",
        )
        .bind(&key.name)
        .bind(&key.organization_id)
        .bind(&key.vps_id)
        .bind(&key.fingerprint)
        .bind(&key.public_key)
        .execute(&self.db)
        .await?
        .last_insert_id())
    }

    async fn get_ssh_key(&self, id: u64) -> Result<SshKey> {
        Ok(sqlx::query_as("select * from ssh_key where id = ?")
            .bind(id)
            .fetch_one(&self.db)
            .await?)
    }

    async fn list_org_ssh_keys(&self, organization_id: &str) -> Result<Vec<SshKey>> {
        Ok(
            sqlx::query_as("select * from ssh_key where organization_id = ? and vps_id is null")
                .bind(organization_id)
                .fetch_all(&self.db)
                .await?,
        )
    }

    async fn list_vps_ssh_keys(&self, vps_id: &str) -> Result<Vec<SshKey>> {
        Ok(sqlx::query_as("select * from ssh_key where vps_id = ?")
            .bind(vps_id)
            .fetch_all(&self.db)
            .await?)
    }

    async fn delete_ssh_key(&self, id: u64) -> Result<()> {
        sqlx::query("delete from ssh_key where id = ?")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn insert_bastion_key(&self, key: &VpsBastionKey) -> Result<u64> {
        Ok(sqlx::query(
            "insert into vps_bastion_key(vps_id,fingerprint,public_key,private_key) values(?,?,?,?)",
        )
        .bind(&key.vps_id)
        .bind(&key.fingerprint)
        .bind(&key.public_key)
        .bind(&key.private_key)
        .execute(&self.db)
        .await?
        .last_insert_id())
    }

    async fn get_bastion_key(&self, vps_id: &str) -> Result<Option<VpsBastionKey>> {
        Ok(sqlx::query_as("select * from vps_bastion_key where vps_id = ?")
            .bind(vps_id)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn delete_bastion_key(&self, vps_id: &str) -> Result<()> {
        sqlx::query("delete from vps_bastion_key where vps_id = ?")
            .bind(vps_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn insert_terminal_key(&self, key: &VpsTerminalKey) -> Result<u64> {
        Ok(sqlx::query(
            "insert into vps_terminal_key(vps_id,fingerprint,public_key,private_key) values(?,?,?,?)",
        )
        .bind(&key.vps_id)
        .bind(&key.fingerprint)
        .bind(&key.public_key)
        .bind(&key.private_key)
        .execute(&self.db)
        .await?
        .last_insert_id())
    }

    async fn get_terminal_key(&self, vps_id: &str) -> Result<Option<VpsTerminalKey>> {
        Ok(
            sqlx::query_as("select * from vps_terminal_key where vps_id = ?")
                .bind(vps_id)
                .fetch_optional(&self.db)
                .await?,
        )
    }

    async fn delete_terminal_key(&self, vps_id: &str) -> Result<()> {
        sqlx::query("delete from vps_terminal_key where vps_id = ?")
            .bind(vps_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}
